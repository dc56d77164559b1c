use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    middleware,
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::{
    catalog::RaidDefinition,
    config::Config,
    coordinator::UpdateStatus,
    documents::{CombatMetric, GuildDocument, RaidBossDocument},
    error::{Result, StatsError},
    observability,
    rank::LeaderboardFilter,
    service::{LeaderboardResponse, StatsContext},
    summary::{CharacterPerformance, GuildListEntry, RaidSummary},
};

#[derive(Serialize)]
struct Envelope<T> {
    success: bool,
    data: T,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

/// `Path` whose rejection is reported in the error envelope.
struct ApiPath<T>(T);

impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = StatsError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        Path::<T>::from_request_parts(parts, state)
            .await
            .map(|Path(value)| Self(value))
            .map_err(|rejection| StatsError::InvalidRequest(rejection.body_text()))
    }
}

/// `Query` whose rejection is reported in the error envelope.
struct ApiQuery<T>(T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = StatsError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| Self(value))
            .map_err(|rejection| StatsError::InvalidRequest(rejection.body_text()))
    }
}

pub async fn run(config: Config) -> Result<()> {
    let ctx = StatsContext::open(&config)?;
    prepare(&ctx).await?;
    let scheduler = ctx.coordinator().spawn_scheduler();

    let app = build_router(ctx);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Starting raidboard server on {addr}");

    let listener = TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| StatsError::Storage(err.to_string()));

    scheduler.abort();
    info!("raidboard server stopped");
    result
}

/// Restores the persisted update status and loads the raid boss cache. A
/// fresh database is initialized here, since `raidboard init` cannot open the
/// store while the server holds it.
pub async fn prepare(ctx: &StatsContext) -> Result<()> {
    let coordinator = ctx.coordinator();
    coordinator.load_state().await?;
    if ctx.store().maintenance()?.is_initialized {
        coordinator.warm_caches().await?;
    } else {
        let created = coordinator.initialize(false).await?;
        info!(created, "initialized empty database");
    }
    Ok(())
}

pub fn build_router(ctx: StatsContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(observability::metrics_handler))
        .route("/raids", get(list_raids))
        .route("/raids/{raid_id}/summary", get(raid_summary))
        .route("/bosses/{boss_id}", get(raid_boss))
        .route("/characters/{realm}/{name}", get(character_performance))
        .route("/leaderboards/{raid}/{metric}", get(leaderboard))
        .route("/guilds", get(guild_list))
        .route("/guilds/{guild_id}", get(guild))
        .route("/update", get(update_status).post(trigger_update))
        .with_state(ctx)
        .layer(middleware::from_fn(observability::track_http_metrics))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

async fn list_raids(State(ctx): State<StatsContext>) -> Json<Envelope<Vec<RaidDefinition>>> {
    ok(ctx.list_raids())
}

async fn raid_summary(
    State(ctx): State<StatsContext>,
    ApiPath(raid_id): ApiPath<u32>,
) -> Result<Json<Envelope<Arc<RaidSummary>>>> {
    Ok(ok(ctx.get_raid_summary(raid_id).await?))
}

async fn raid_boss(
    State(ctx): State<StatsContext>,
    ApiPath(boss_id): ApiPath<String>,
) -> Result<Json<Envelope<Arc<RaidBossDocument>>>> {
    Ok(ok(ctx.get_raid_boss(&boss_id).await?))
}

#[derive(Deserialize)]
struct CharacterQuery {
    class: u8,
    raid: String,
}

async fn character_performance(
    State(ctx): State<StatsContext>,
    ApiPath((realm, name)): ApiPath<(String, String)>,
    ApiQuery(params): ApiQuery<CharacterQuery>,
) -> Result<Json<Envelope<Arc<CharacterPerformance>>>> {
    let performance = ctx
        .get_character_performance(&name, params.class, &realm, &params.raid)
        .await?;
    Ok(ok(performance))
}

#[derive(Deserialize, Default)]
struct LeaderboardQuery {
    #[serde(default)]
    class: Option<u8>,
    #[serde(default)]
    spec: Option<u16>,
    #[serde(default)]
    realm: Option<String>,
    #[serde(default)]
    faction: Option<u8>,
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    size: Option<usize>,
}

async fn leaderboard(
    State(ctx): State<StatsContext>,
    ApiPath((raid, metric)): ApiPath<(String, String)>,
    ApiQuery(params): ApiQuery<LeaderboardQuery>,
) -> Result<Json<Envelope<LeaderboardResponse>>> {
    let metric: CombatMetric = metric.parse()?;
    let filter = LeaderboardFilter {
        class: params.class,
        spec: params.spec,
        realm: params.realm,
        faction: params.faction,
    };
    let page = params.page.unwrap_or(1);
    let size = params.size.unwrap_or(ctx.page_limit());
    let board = ctx
        .get_character_leaderboard(&raid, metric, filter, page, size)
        .await?;
    Ok(ok(board))
}

async fn guild_list(
    State(ctx): State<StatsContext>,
) -> Result<Json<Envelope<Arc<Vec<GuildListEntry>>>>> {
    Ok(ok(ctx.get_guild_list().await?))
}

async fn guild(
    State(ctx): State<StatsContext>,
    ApiPath(guild_id): ApiPath<String>,
) -> Result<Json<Envelope<GuildDocument>>> {
    Ok(ok(ctx.get_guild(&guild_id).await?))
}

async fn update_status(State(ctx): State<StatsContext>) -> Json<Envelope<UpdateStatus>> {
    ok(ctx.get_update_status())
}

async fn trigger_update(State(ctx): State<StatsContext>) -> Result<impl IntoResponse> {
    ctx.trigger_update()?;
    Ok((StatusCode::ACCEPTED, ok(ctx.get_update_status())))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
