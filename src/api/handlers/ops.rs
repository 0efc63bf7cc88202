//! `GET /health` — ops-facing readiness probe (§6, §10.3): not authenticated,
//! carries no instance data, folds in the Prometheus counters since there is
//! no separate metrics surface (§9 Non-goals).

use axum::extract::State;
use axum::Json;

use crate::api::state::AppState;
use crate::api::types::{FleetSummary, HealthComponent, HealthResponse};

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut components = Vec::new();

    components.push(HealthComponent {
        name: "cache".to_string(),
        healthy: !state.cache.is_degraded(),
        message: state.cache.is_degraded().then(|| "running on local fallback".to_string()),
    });

    let store_healthy = state.store.count_active_tunnels().await.is_ok();
    components.push(HealthComponent {
        name: "store".to_string(),
        healthy: store_healthy,
        message: (!store_healthy).then(|| "store query failed".to_string()),
    });

    let fleet = state.relay_registry.fleet_stats().await;
    components.push(HealthComponent { name: "relay_fleet".to_string(), healthy: true, message: None });

    let status = if components.iter().all(|c| c.healthy) { "ok" } else { "degraded" };
    state.metrics.log_status();

    Json(HealthResponse {
        status: status.to_string(),
        uptime_seconds: state.uptime_seconds(),
        components,
        fleet: FleetSummary {
            server_count: fleet.server_count as usize,
            utilization_pct: fleet.utilization_pct,
            bw_utilization_pct: fleet.bw_utilization_pct,
        },
    })
}

/// `GET /health/metrics` — plain-text Prometheus exposition, grouped with the
/// readiness probe rather than a first-class `/metrics` route (§9 Non-goals
/// exclude a dedicated metrics surface; the counters still need an exit).
pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.prometheus()
}
