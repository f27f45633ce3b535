use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::breaker::BreakerSnapshot;
use crate::AppState;

#[derive(Debug, Serialize)]
struct HealthDetail {
    status: &'static str,
    uptime_secs: u64,
    connections: ConnectionCounts,
    queue_depth: usize,
    drop_ratio: f64,
    broker: BreakerSnapshot,
    rate_limiter_tracked: usize,
}

#[derive(Debug, Serialize)]
struct ConnectionCounts {
    total: usize,
    staff_waiter: usize,
    staff_kitchen: usize,
    staff_admin: usize,
    diner: usize,
}

#[derive(Debug, Serialize)]
struct HealthSummary {
    status: &'static str,
    connections: ConnectionCounts,
}

fn connection_counts(state: &AppState) -> ConnectionCounts {
    let counts = state.registry.counts_by_kind();
    ConnectionCounts {
        total: state.registry.len(),
        staff_waiter: counts.get("staff_waiter").copied().unwrap_or(0),
        staff_kitchen: counts.get("staff_kitchen").copied().unwrap_or(0),
        staff_admin: counts.get("staff_admin").copied().unwrap_or(0),
        diner: counts.get("diner").copied().unwrap_or(0),
    }
}

/// Liveness summary. Broker trouble does not fail this probe; it is
/// visible in `/health/detail` instead.
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthSummary {
            status: "ok",
            connections: connection_counts(&state),
        }),
    )
}

pub async fn health_detail(State(state): State<AppState>) -> impl IntoResponse {
    let detail = HealthDetail {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        connections: connection_counts(&state),
        queue_depth: state.pipeline.queue.len(),
        drop_ratio: state.pipeline.drops.ratio(),
        broker: state.pipeline.breaker.snapshot(),
        rate_limiter_tracked: state.limiter.tracked(),
    };
    Json(detail)
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}
