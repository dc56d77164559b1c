use std::time::Instant;

use anyhow::{Result, anyhow};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();
static START_TIME: OnceCell<Instant> = OnceCell::new();

pub fn init() -> Result<()> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("raidboard_http_request_duration_seconds".into()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        )
        .map_err(|err| anyhow!("failed to configure prometheus exporter: {err}"))?
        .set_buckets_for_metric(
            Matcher::Full("raidboard_update_cycle_duration_seconds".into()),
            &[0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0],
        )
        .map_err(|err| anyhow!("failed to configure prometheus exporter: {err}"))?;
    let handle = builder
        .install_recorder()
        .map_err(|err| anyhow!("failed to initialise prometheus recorder: {err}"))?;

    describe_counter!(
        "raidboard_http_requests_total",
        "Total number of HTTP requests processed by the raidboard server."
    );
    describe_histogram!(
        "raidboard_http_request_duration_seconds",
        "HTTP request latency observed by the raidboard server."
    );
    describe_counter!(
        "raidboard_update_cycles_total",
        "Update, guild refresh and initialization cycles by outcome."
    );
    describe_histogram!(
        "raidboard_update_cycle_duration_seconds",
        "Wall time of update cycles."
    );
    describe_histogram!(
        "raidboard_rank_recompute_seconds",
        "Time spent re-ranking one character collection."
    );
    describe_counter!(
        "raidboard_bug_filter_drops_total",
        "Raid logs discarded by a bug filter."
    );
    describe_counter!(
        "raidboard_cache_requests_total",
        "Cache lookups by cache and result."
    );
    describe_counter!(
        "raidboard_store_operations_total",
        "Total number of operations executed by the document store."
    );
    describe_histogram!(
        "raidboard_store_operation_duration_seconds",
        "Duration of operations executed by the document store."
    );
    describe_counter!(
        "raidboard_game_api_requests_total",
        "Requests sent to the game API by endpoint and status."
    );

    let _ = PROMETHEUS_HANDLE.set(handle);
    let _ = START_TIME.set(Instant::now());
    Ok(())
}

pub async fn metrics_handler() -> Response {
    if PROMETHEUS_HANDLE.get().is_none() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not initialised",
        )
            .into_response();
    }

    let body = render_metrics();
    let headers = [(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    )];
    (StatusCode::OK, headers, body).into_response()
}

pub async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().as_str().to_owned();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [("method", method), ("path", path), ("status", status)];
    counter!("raidboard_http_requests_total", &labels).increment(1);
    histogram!("raidboard_http_request_duration_seconds", &labels).record(latency);

    response
}

pub fn record_game_api_request(endpoint: &'static str, status: &'static str) {
    let labels = [("endpoint", endpoint), ("status", status)];
    counter!("raidboard_game_api_requests_total", &labels).increment(1);
}

pub fn render_metrics() -> String {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        let mut body = handle.render();
        if let Some(start) = START_TIME.get() {
            let uptime = start.elapsed().as_secs_f64();
            body.push_str(&format!("raidboard_uptime_seconds{{}} {}\n", uptime));
        }
        body
    } else {
        String::new()
    }
}
