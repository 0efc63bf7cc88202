//! `/instances` — list/create/rename/delete, heartbeat, connect/disconnect,
//! status history and health snapshot (§6).

use std::time::Instant;

use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use crate::api::auth::AuthUser;
use crate::api::state::AppState;
use crate::api::types::{
    ConnectResponse, CreateInstanceRequest, HeartbeatRequest, HeartbeatResponse, InstanceHealthResponse,
    InstanceListResponse, InstanceResponse, RenameInstanceRequest, SimpleSuccess, StatusHistoryResponse,
};
use crate::capacity::quota_remaining;
use crate::domain::{HealthSample, Instance, InstancePatch};
use crate::error::{CoreError, Result};

/// Loads the instance and confirms `user` owns it. A mismatched owner is
/// reported as `not_found`, not `forbidden` (§6 scenario 6: avoid an
/// existence oracle for other users' instances).
async fn load_owned(state: &AppState, user_id: Uuid, instance_id: Uuid) -> Result<Instance> {
    let instance = state
        .store
        .get_instance(instance_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("instance {instance_id} not found")))?;
    if instance.owner != user_id {
        return Err(CoreError::NotFound(format!("instance {instance_id} not found")));
    }
    Ok(instance)
}

async fn last_heartbeat(state: &AppState, instance_id: Uuid) -> Option<chrono::DateTime<chrono::Utc>> {
    state
        .cache
        .get(&crate::cache::Cache::heartbeat_key(&instance_id))
        .await
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(&raw).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

pub async fn list(State(state): State<AppState>, AuthUser(user): AuthUser) -> Result<Json<InstanceListResponse>> {
    let instances = state.store.list_instances_by_user(user.id).await?;
    let mut out = Vec::with_capacity(instances.len());
    for instance in instances {
        let heartbeat = last_heartbeat(&state, instance.id).await;
        out.push(InstanceResponse::new(instance, heartbeat));
    }

    let plan = user.effective_plan(chrono::Utc::now());
    let active_count = state.store.count_user_active_tunnels(user.id).await?;
    let quota_remaining = quota_remaining(plan, active_count);

    Ok(Json(InstanceListResponse { instances: out, quota_remaining }))
}

/// `POST /instances` — gated by Capacity Admission (§4.7) before the row is
/// created; the admission bundle is only used for logging, the write itself
/// goes through the FSM's `create_instance` (`∅ → inactive`, §4.4).
pub async fn create(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(axum::http::StatusCode, Json<InstanceResponse>)> {
    if req.name.trim().is_empty() {
        return Err(CoreError::Validation("name must not be empty".to_string()));
    }

    let info = state.capacity.admit(state.store.as_ref(), &user).await?;
    let region = req.region.as_deref().unwrap_or("us");
    let instance = state
        .fsm
        .create_instance(user.id, &req.name, req.local_port, region, req.server_host.as_deref())
        .await?;

    tracing::info!(
        instance_id = %instance.id,
        fleet_utilization_pct = info.fleet_utilization_pct,
        user_active_tunnels = info.user_active_tunnels,
        "instances: created under capacity admission"
    );
    Ok((axum::http::StatusCode::CREATED, Json(InstanceResponse::new(instance, None))))
}

pub async fn rename(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameInstanceRequest>,
) -> Result<Json<InstanceResponse>> {
    if req.name.trim().is_empty() {
        return Err(CoreError::Validation("name must not be empty".to_string()));
    }
    let instance = load_owned(&state, user.id, id).await?;
    let patch = InstancePatch { name: Some(req.name), ..Default::default() };
    let updated = state.store.update_instance(instance.id, &patch).await?;
    let heartbeat = last_heartbeat(&state, updated.id).await;
    Ok(Json(InstanceResponse::new(updated, heartbeat)))
}

/// `DELETE /instances/:id` — revokes the token, clears FSM state and the
/// heartbeat cache entry (§6), then removes the row.
pub async fn delete(State(state): State<AppState>, AuthUser(user): AuthUser, Path(id): Path<Uuid>) -> Result<Json<SimpleSuccess>> {
    let instance = load_owned(&state, user.id, id).await?;
    state.fsm.delete_instance(&instance).await?;
    Ok(Json(SimpleSuccess { success: true }))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>> {
    let started = Instant::now();
    let instance = load_owned(&state, user.id, id).await?;

    let has_payload = req.vscode_responsive.is_some()
        || req.last_activity.is_some()
        || req.cpu_usage.is_some()
        || req.memory_usage.is_some()
        || req.has_code_server.is_some();
    let sample = has_payload.then(|| HealthSample {
        instance_id: instance.id,
        ts: Some(chrono::Utc::now()),
        vscode_responsive: req.vscode_responsive,
        last_activity_epoch: req.last_activity,
        cpu_pct: req.cpu_usage,
        mem_bytes: req.memory_usage,
        has_code_server: req.has_code_server,
    });

    let outcome = state.heartbeat.record(&instance, sample).await?;
    state.metrics.record_heartbeat(started.elapsed());
    Ok(Json(HeartbeatResponse { success: true, status: outcome.status, reason: outcome.reason }))
}

/// `POST /instances/:id/connect` — gated by Capacity Admission, then the FSM
/// (`inactive/error/offline → starting`, §4.4).
pub async fn connect(State(state): State<AppState>, AuthUser(user): AuthUser, Path(id): Path<Uuid>) -> Result<Json<ConnectResponse>> {
    let instance = load_owned(&state, user.id, id).await?;
    state.capacity.admit(state.store.as_ref(), &user).await?;
    let outcome = state.fsm.connect(&instance).await?;
    Ok(Json(ConnectResponse::new(&outcome.token.token, &outcome.relay, instance.local_port, outcome.token.expires_at)))
}

/// `POST /instances/:id/disconnect` — user-initiated stop; idempotent on an
/// already-disconnected instance (§8 law).
pub async fn disconnect(State(state): State<AppState>, AuthUser(user): AuthUser, Path(id): Path<Uuid>) -> Result<Json<SimpleSuccess>> {
    let instance = load_owned(&state, user.id, id).await?;
    state.fsm.tunnel_disconnected(&instance, "user requested disconnect").await?;
    Ok(Json(SimpleSuccess { success: true }))
}

pub async fn status_history(State(state): State<AppState>, AuthUser(user): AuthUser, Path(id): Path<Uuid>) -> Result<Json<StatusHistoryResponse>> {
    load_owned(&state, user.id, id).await?;
    let entries = state.store.list_status_history(id, 100).await?;
    Ok(Json(StatusHistoryResponse { entries }))
}

/// `GET /instances/:id/health` — a classifier-facing snapshot, not the raw
/// row (§6 scenario 6).
pub async fn health(State(state): State<AppState>, AuthUser(user): AuthUser, Path(id): Path<Uuid>) -> Result<Json<InstanceHealthResponse>> {
    let instance = load_owned(&state, user.id, id).await?;
    let heartbeat = last_heartbeat(&state, instance.id).await;
    Ok(Json(InstanceHealthResponse {
        status: instance.status,
        status_reason: instance.status_reason,
        tunnel_connected: instance.tunnel_connected,
        last_heartbeat: heartbeat,
    }))
}
