//! Store (C1): durable, transactional storage for users, instances, tunnel
//! tokens, relays, status history and health samples (§4.1). The core talks
//! to Postgres only through the [`Store`] trait so FSM/heartbeat/broker code
//! never depends on `sqlx` directly.

pub mod postgres;

pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    HealthSample, Instance, InstancePatch, InstanceStatus, Plan, Relay, RelayStatus,
    RefreshToken, StatusHistoryEntry, TunnelToken, User,
};
use crate::error::Result;

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_user_and_assign_trial(&self, email: &str, password_hash: &str, name: &str) -> Result<User>;
    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<User>>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn update_plan(&self, user_id: Uuid, plan: Plan, expires_at: Option<DateTime<Utc>>) -> Result<()>;

    async fn create_instance(
        &self,
        owner: Uuid,
        name: &str,
        local_port: u16,
        region: &str,
        preferred_host: Option<&str>,
    ) -> Result<Instance>;
    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>>;
    async fn list_instances_by_user(&self, owner: Uuid) -> Result<Vec<Instance>>;
    /// Applies `patch` under `SELECT ... FOR UPDATE` row locking and, iff the
    /// patch changes `status` from what was on the row, appends a
    /// [`StatusHistoryEntry`] in the same transaction (I6, §4.3 step 4).
    async fn update_instance(&self, id: Uuid, patch: &InstancePatch) -> Result<Instance>;
    async fn delete_instance(&self, id: Uuid) -> Result<()>;

    async fn save_tunnel_token(&self, token: &TunnelToken) -> Result<()>;
    async fn get_tunnel_token(&self, token: &str) -> Result<Option<TunnelToken>>;
    async fn delete_tunnel_token(&self, token: &str) -> Result<()>;
    async fn delete_tunnel_token_for_instance(&self, instance_id: Uuid) -> Result<()>;
    async fn delete_user_tunnel_tokens(&self, user_id: Uuid) -> Result<()>;
    async fn count_active_tunnel_tokens_for_instance(&self, instance_id: Uuid) -> Result<i64>;
    async fn reap_expired_tunnel_tokens(&self) -> Result<u64>;

    async fn save_refresh_token(&self, token: &RefreshToken) -> Result<()>;
    async fn get_refresh_token(&self, token: &str) -> Result<Option<RefreshToken>>;
    async fn delete_refresh_token(&self, token: &str) -> Result<()>;
    async fn delete_user_refresh_tokens(&self, user_id: Uuid) -> Result<()>;

    async fn save_health_sample(&self, sample: &HealthSample) -> Result<()>;
    async fn get_latest_health_sample(&self, instance_id: Uuid) -> Result<Option<HealthSample>>;

    async fn list_status_history(&self, instance_id: Uuid, limit: i64) -> Result<Vec<StatusHistoryEntry>>;

    async fn relay_upsert(&self, relay: &Relay) -> Result<()>;
    async fn relay_set_status(&self, relay_id: &str, status: RelayStatus) -> Result<()>;
    async fn relay_update_load(&self, relay_id: &str, current_load: u32, instantaneous_bw_mbps: f64) -> Result<()>;
    async fn list_relays(&self) -> Result<Vec<Relay>>;
    async fn get_relay(&self, relay_id: &str) -> Result<Option<Relay>>;

    async fn count_active_tunnels(&self) -> Result<i64>;
    async fn count_user_active_tunnels(&self, user_id: Uuid) -> Result<i64>;

    /// Instances in the connected tier whose `last_heartbeat_at` predates
    /// `cutoff`, or is unset (sweeper's instance demoter, §4.9).
    /// `last_heartbeat_at` is the true last-beat signal — stamped by
    /// [`Store::touch_heartbeat`] on every heartbeat RPC and by the
    /// `tunnel-connected` callback — unlike `updated_at`, which only moves
    /// on a status change and freezes for an instance that keeps
    /// heartbeating at a steady status.
    async fn list_stale_connected_instances(&self, cutoff: DateTime<Utc>) -> Result<Vec<Instance>>;

    /// Stamps `last_heartbeat_at` to `ts` without touching `status` or
    /// `updated_at` (§4.3): called on every heartbeat RPC regardless of
    /// whether the classifier's verdict changes the instance's status.
    async fn touch_heartbeat(&self, instance_id: Uuid, ts: DateTime<Utc>) -> Result<()>;
}

/// Shared shape for the `status=offline` terminal-rest-state check used by
/// the classifier and sweeper (§4.3 step 1: `instance.status = offline`).
pub fn is_rest_status(status: InstanceStatus) -> bool {
    matches!(status, InstanceStatus::Inactive | InstanceStatus::Error | InstanceStatus::Offline)
}
