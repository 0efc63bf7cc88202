//! Wire DTOs for the `/api/v1` surface (§6). Persisted fields stay
//! snake_case (they mirror [`crate::domain`] directly); request/response
//! shapes that the spec calls out in camelCase (`tunnelToken`,
//! `boreServerHost`, ...) are renamed at the edge via `serde(rename)` so the
//! core types never carry two spellings of the same field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Instance, InstanceStatus, Plan, Relay, StatusHistoryEntry, User};

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub plan: String,
    #[serde(rename = "isAdmin")]
    pub is_admin: bool,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self { id: user.id, email: user.email.clone(), name: user.name.clone(), plan: user.plan.as_str().to_string(), is_admin: user.is_admin }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
    pub user: UserResponse,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub local_port: u16,
    pub region: Option<String>,
    pub server_host: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameInstanceRequest {
    pub name: String,
}

/// `GET /instances` / `GET /instances/:id` row shape — the instance plus the
/// heartbeat metadata the dashboard actually renders (§6: "list owner's
/// instances with heartbeat metadata").
#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    pub id: Uuid,
    pub name: String,
    pub local_port: u16,
    pub region: String,
    pub status: InstanceStatus,
    pub status_reason: String,
    pub tunnel_connected: bool,
    pub public_url: Option<String>,
    pub assigned_relay: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl InstanceResponse {
    pub fn new(instance: Instance, last_heartbeat: Option<DateTime<Utc>>) -> Self {
        Self {
            id: instance.id,
            name: instance.name,
            local_port: instance.local_port,
            region: instance.region,
            status: instance.status,
            status_reason: instance.status_reason,
            tunnel_connected: instance.tunnel_connected,
            public_url: instance.public_url,
            assigned_relay: instance.assigned_relay,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
            last_heartbeat,
        }
    }
}

/// `GET /instances` envelope: the owner's instances plus how many more
/// concurrent tunnels their plan allows (§4.7 quota, surfaced for the
/// dashboard rather than making the caller re-derive it from `plan`).
#[derive(Debug, Serialize)]
pub struct InstanceListResponse {
    pub instances: Vec<InstanceResponse>,
    pub quota_remaining: u32,
}

#[derive(Debug, Deserialize, Default)]
pub struct HeartbeatRequest {
    pub vscode_responsive: Option<bool>,
    pub last_activity: Option<i64>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<i64>,
    pub has_code_server: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub status: InstanceStatus,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ServerInfo {
    #[serde(rename = "serverId")]
    pub server_id: String,
    pub utilization: f64,
}

/// `POST /instances/:id/connect` response (§6 — camelCase over the wire).
#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    #[serde(rename = "tunnelToken")]
    pub tunnel_token: String,
    #[serde(rename = "boreServerHost")]
    pub bore_server_host: String,
    #[serde(rename = "boreServerPort")]
    pub bore_server_port: u16,
    #[serde(rename = "localPort")]
    pub local_port: u16,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

impl ConnectResponse {
    pub fn new(token: &str, relay: &Relay, local_port: u16, expires_at: DateTime<Utc>) -> Self {
        Self {
            tunnel_token: token.to_string(),
            bore_server_host: relay.host.clone(),
            bore_server_port: relay.port,
            local_port,
            expires_at,
            server_info: ServerInfo { server_id: relay.id.clone(), utilization: relay.utilization_pct() },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SimpleSuccess {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusHistoryResponse {
    pub entries: Vec<StatusHistoryEntry>,
}

/// `GET /instances/:id/health` — a snapshot of the classifier's view, not the
/// raw instance row (§6 scenario 6: must 404 for a non-owner rather than
/// leaking existence via 403).
#[derive(Debug, Serialize)]
pub struct InstanceHealthResponse {
    pub status: InstanceStatus,
    pub status_reason: String,
    pub tunnel_connected: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateKeyRequest {
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct TunnelConnectedRequest {
    #[serde(rename = "remotePort")]
    pub remote_port: u16,
    #[serde(rename = "publicUrl")]
    pub public_url: Option<String>,
}

/// Readiness breakdown for `GET /health` (§6, §10.3: ops-facing, carries no
/// instance data, not authenticated).
#[derive(Debug, Serialize)]
pub struct HealthComponent {
    pub name: String,
    pub healthy: bool,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: i64,
    pub components: Vec<HealthComponent>,
    pub fleet: FleetSummary,
}

#[derive(Debug, Serialize)]
pub struct FleetSummary {
    pub server_count: usize,
    pub utilization_pct: f64,
    pub bw_utilization_pct: f64,
}

pub fn plan_from_str(raw: &str) -> crate::error::Result<Plan> {
    Plan::try_from(raw)
}
