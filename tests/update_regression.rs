use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;

use raidboard::{
    Config, StatsContext, StatsError,
    documents::CombatMetric,
    error::Result as StatsResult,
    game_api::{GameApi, GuildFetch, RaidLogBatch, RawGuild, RawLog, RawMember},
    keys,
    rank::LeaderboardFilter,
    server::{build_router, prepare},
    store::DocumentStore,
};

#[derive(Default)]
struct FakeGameApi {
    logs: Mutex<Vec<RawLog>>,
}

impl FakeGameApi {
    fn push(&self, log: RawLog) {
        self.logs.lock().push(log);
    }
}

#[async_trait]
impl GameApi for FakeGameApi {
    async fn fetch_raid_logs(&self, last_log_ids: &BTreeMap<String, u64>) -> StatsResult<RaidLogBatch> {
        let mut batch = RaidLogBatch {
            logs: Vec::new(),
            last_log_ids: last_log_ids.clone(),
        };
        for log in self.logs.lock().iter() {
            let realm = keys::realm_key(&log.realm);
            let from = last_log_ids.get(&realm).copied().unwrap_or(0);
            if log.log_id <= from {
                continue;
            }
            let entry = batch.last_log_ids.entry(realm).or_insert(0);
            *entry = (*entry).max(log.log_id);
            batch.logs.push(log.clone());
        }
        Ok(batch)
    }

    async fn fetch_guild_data(&self, _name: &str, _realm: &str) -> StatsResult<GuildFetch> {
        Ok(GuildFetch::NotFound)
    }
}

fn member(name: &str, damage: u64) -> RawMember {
    RawMember {
        name: name.to_string(),
        class: 4,
        spec: 259,
        race: 1,
        ilvl: 535.0,
        damage_done: damage,
        healing_done: 0,
        absorb_done: 0,
    }
}

fn kill(log_id: u64, boss: u32, fight_time_ms: u64, members: Vec<RawMember>) -> RawLog {
    RawLog {
        log_id,
        realm: "Evermoon".to_string(),
        encounter_id: boss,
        difficulty: 5,
        encounter_name: String::new(),
        fight_time_ms,
        killtime: Utc.with_ymd_and_hms(2025, 4, 2, 21, 0, 0).unwrap()
            + chrono::Duration::minutes(log_id as i64),
        guild: Some(RawGuild {
            name: "Method".to_string(),
            faction: 0,
        }),
        members,
    }
}

async fn setup() -> Result<(TempDir, Arc<FakeGameApi>, StatsContext)> {
    let dir = tempfile::tempdir()?;
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.game_api.realms = vec!["Evermoon".to_string()];
    let store = Arc::new(DocumentStore::open(config.store_path(), false)?);
    let api = Arc::new(FakeGameApi::default());
    let ctx = StatsContext::new(&config, store, api.clone())?;
    ctx.coordinator().initialize(false).await?;
    Ok((dir, api, ctx))
}

#[tokio::test]
async fn best_value_survives_a_weaker_later_kill() -> Result<()> {
    let (_dir, api, ctx) = setup().await?;

    api.push(kill(1, 1577, 100_000, vec![member("Rogue", 450_000)]));
    ctx.coordinator().run_update().await?;
    api.push(kill(2, 1577, 100_000, vec![member("Rogue", 420_000)]));
    let report = ctx.coordinator().run_update().await?;
    assert_eq!(report.fetched, 1);
    assert_eq!(report.characters_written, 0);

    let boss = ctx.get_raid_boss("1577-5").await?;
    assert_eq!(boss.kill_count, 2);
    assert_eq!(boss.dps.best_overall.as_ref().map(|b| b.value), Some(4_500.0));

    let board = ctx
        .get_character_leaderboard(
            "Throne of Thunder",
            CombatMetric::Dps,
            LeaderboardFilter::default(),
            1,
            10,
        )
        .await?;
    assert_eq!(board.total, 1);
    assert_eq!(board.entries[0].value, 4_500.0);
    Ok(())
}

#[tokio::test]
async fn full_bucket_rejects_a_lower_candidate() -> Result<()> {
    let (_dir, api, ctx) = setup().await?;

    let members = (0..10u64)
        .map(|i| member(&format!("Rogue{i}"), 500_000 + i * 10_000))
        .collect();
    api.push(kill(1, 1577, 100_000, members));
    ctx.coordinator().run_update().await?;
    api.push(kill(2, 1577, 100_000, vec![member("Latecomer", 100_000)]));
    ctx.coordinator().run_update().await?;

    let boss = ctx.get_raid_boss("1577-5").await?;
    let bucket = boss
        .dps
        .buckets
        .values()
        .next()
        .ok_or_else(|| anyhow::anyhow!("missing bucket"))?;
    assert_eq!(bucket.characters.len(), 10);
    assert!(bucket.characters.iter().all(|c| c.name != "Latecomer"));
    assert!(
        bucket
            .characters
            .windows(2)
            .all(|pair| pair[0].value >= pair[1].value)
    );
    assert_eq!(bucket.top, 5_900.0);

    // The character collection still records every performance.
    let performance = ctx
        .get_character_performance("Latecomer", 4, "Evermoon", "Throne of Thunder")
        .await?;
    assert_eq!(performance.bosses[0].rank, 11);
    Ok(())
}

#[tokio::test]
async fn bugged_logs_are_dropped_but_watermark_advances() -> Result<()> {
    let (_dir, api, ctx) = setup().await?;

    api.push(kill(1, 1577, 9_000_000, vec![member("Rogue", 450_000)]));
    api.push(kill(2, 424242, 100_000, vec![member("Rogue", 450_000)]));
    let report = ctx.coordinator().run_update().await?;
    assert_eq!(report.fetched, 2);
    assert_eq!(report.dropped, 2);
    assert_eq!(report.characters_written, 0);

    let maintenance = ctx.store().maintenance()?;
    assert_eq!(maintenance.last_log_ids.get("evermoon"), Some(&2));
    assert_eq!(ctx.get_raid_boss("1577-5").await?.kill_count, 0);
    Ok(())
}

#[tokio::test]
async fn http_surface_serves_envelopes() -> Result<()> {
    let (_dir, api, ctx) = setup().await?;
    api.push(kill(1, 1577, 100_000, vec![member("Rogue", 450_000)]));
    ctx.coordinator().run_update().await?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = build_router(ctx.clone());
    let server = tokio::spawn(async move { axum::serve(listener, app).await });
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let health: Value = client.get(format!("{base}/health")).send().await?.json().await?;
    assert_eq!(health["status"], "ok");

    let boss: Value = client
        .get(format!("{base}/bosses/1577-5"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(boss["success"], true);
    assert_eq!(boss["data"]["kill_count"], 1);

    let missing = client.get(format!("{base}/bosses/1577-9")).send().await?;
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    let missing: Value = missing.json().await?;
    assert_eq!(missing["success"], false);

    let board: Value = client
        .get(format!("{base}/leaderboards/Throne%20of%20Thunder/dps?class=4&page=1&size=5"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(board["data"]["total"], 1);
    assert_eq!(board["data"]["entries"][0]["name"], "Rogue");

    let bad_raid = client.get(format!("{base}/raids/abc/summary")).send().await?;
    assert_eq!(bad_raid.status(), reqwest::StatusCode::BAD_REQUEST);
    let bad_raid: Value = bad_raid.json().await?;
    assert_eq!(bad_raid["success"], false);
    assert!(bad_raid["message"].as_str().is_some_and(|m| !m.is_empty()));

    let missing_class = client
        .get(format!("{base}/characters/Evermoon/Rogue?raid=Throne%20of%20Thunder"))
        .send()
        .await?;
    assert_eq!(missing_class.status(), reqwest::StatusCode::BAD_REQUEST);
    let missing_class: Value = missing_class.json().await?;
    assert_eq!(missing_class["success"], false);

    let bad_metric = client
        .get(format!("{base}/leaderboards/Throne%20of%20Thunder/tps"))
        .send()
        .await?;
    assert_eq!(bad_metric.status(), reqwest::StatusCode::BAD_REQUEST);

    let performance: Value = client
        .get(format!(
            "{base}/characters/Evermoon/Rogue?class=4&raid=Throne%20of%20Thunder"
        ))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(performance["data"]["bosses"][0]["rank"], 1);

    let triggered = client.post(format!("{base}/update")).send().await?;
    assert_eq!(triggered.status(), reqwest::StatusCode::ACCEPTED);
    for _ in 0..100 {
        if !ctx.get_update_status().is_updating {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let status: Value = client.get(format!("{base}/update")).send().await?.json().await?;
    assert_eq!(status["data"]["is_updating"], false);
    assert_eq!(status["data"]["phase"], "idle");

    server.abort();
    Ok(())
}

#[tokio::test]
async fn server_startup_initializes_a_fresh_database() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.game_api.realms = vec!["Evermoon".to_string()];
    let store = Arc::new(DocumentStore::open(config.store_path(), false)?);
    let api = Arc::new(FakeGameApi::default());
    let ctx = StatsContext::new(&config, store, api.clone())?;
    assert!(!ctx.store().maintenance()?.is_initialized);

    prepare(&ctx).await?;
    assert!(ctx.store().maintenance()?.is_initialized);
    assert_eq!(ctx.get_raid_boss("1577-5").await?.kill_count, 0);

    api.push(kill(1, 1577, 100_000, vec![member("Rogue", 450_000)]));
    ctx.coordinator().run_update().await?;
    assert_eq!(ctx.get_raid_boss("1577-5").await?.kill_count, 1);

    // Restarting on the same store keeps what was ingested.
    prepare(&ctx).await?;
    assert_eq!(ctx.get_raid_boss("1577-5").await?.kill_count, 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_cycles_are_rejected() -> Result<()> {
    let (_dir, api, ctx) = setup().await?;
    for id in 1..=30 {
        api.push(kill(id, 1577, 100_000, vec![member("Rogue", 450_000 + id)]));
    }

    let coordinator = ctx.coordinator();
    let (first, second) = tokio::join!(coordinator.run_update(), coordinator.run_update());
    let outcomes = [first.is_ok(), second.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let rejected = first.err().or(second.err());
    assert!(matches!(rejected, Some(StatsError::AlreadyUpdating)));
    assert_eq!(ctx.get_raid_boss("1577-5").await?.kill_count, 30);
    Ok(())
}
