//! Relay-facing routes under `/internal` (§6): authenticated by a static
//! `X-Internal-Api-Key` rather than a user's bearer token, since the caller
//! is a relay process, not a dashboard session.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use uuid::Uuid;

use crate::api::auth::ensure_internal_key_authorized;
use crate::api::state::AppState;
use crate::api::types::{TunnelConnectedRequest, ValidateKeyRequest};
use crate::domain::TokenValidation;
use crate::error::{CoreError, Result};

pub async fn validate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ValidateKeyRequest>,
) -> Result<Json<TokenValidation>> {
    ensure_internal_key_authorized(&headers, &state.config.internal_api_key)?;
    let verdict = state.token_broker.validate(&req.api_key).await?;
    Ok(Json(verdict))
}

pub async fn tunnel_connected(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<TunnelConnectedRequest>,
) -> Result<Json<crate::api::types::InstanceResponse>> {
    ensure_internal_key_authorized(&headers, &state.config.internal_api_key)?;
    let instance = fetch_instance(&state, id).await?;
    let updated = state.fsm.tunnel_connected(&instance, req.remote_port, req.public_url).await?;
    Ok(Json(crate::api::types::InstanceResponse::new(updated, None)))
}

pub async fn tunnel_disconnected(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<crate::api::types::InstanceResponse>> {
    ensure_internal_key_authorized(&headers, &state.config.internal_api_key)?;
    let instance = fetch_instance(&state, id).await?;
    let updated = state.fsm.tunnel_disconnected(&instance, "relay reported disconnect").await?;
    Ok(Json(crate::api::types::InstanceResponse::new(updated, None)))
}

async fn fetch_instance(state: &AppState, id: Uuid) -> Result<crate::domain::Instance> {
    state.store.get_instance(id).await?.ok_or_else(|| CoreError::NotFound(format!("instance {id} not found")))
}
