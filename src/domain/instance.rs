use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::InstanceStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub owner: Uuid,
    pub name: String,
    pub local_port: u16,
    pub region: String,
    pub preferred_host: Option<String>,
    pub assigned_relay: Option<String>,
    pub status: InstanceStatus,
    pub status_reason: String,
    pub tunnel_connected: bool,
    pub public_url: Option<String>,
    pub remote_port: Option<u16>,
    pub current_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Last time a heartbeat RPC (or a `tunnel-connected` callback, which
    /// stamps it so a freshly-activated instance isn't swept before its
    /// first beat arrives) touched this instance. Distinct from
    /// `updated_at`, which only moves on a *status* change and therefore
    /// freezes for an instance that keeps heartbeating at a steady status —
    /// this is the column the sweeper's instance demoter actually reads.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// I2: tunnel_connected=true => assigned_relay, current_token, remote_port all present.
    /// I3: status=offline => tunnel_connected=false, public_url=None, remote_port=None.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.tunnel_connected
            && (self.assigned_relay.is_none() || self.current_token.is_none() || self.remote_port.is_none())
        {
            return Err("I2 violated: tunnel_connected without relay/token/port".into());
        }
        if self.status == InstanceStatus::Offline
            && (self.tunnel_connected || self.public_url.is_some() || self.remote_port.is_some())
        {
            return Err("I3 violated: offline instance retains connection fields".into());
        }
        Ok(())
    }
}

/// Partial patch applied by the Store's merge-write `update_instance`. `None`
/// fields are left untouched; `Some(None)` (via the `Clearable` wrapper)
/// explicitly clears a nullable column. This shape is what lets C4 enforce
/// I2/I3 structurally: it never constructs a patch that sets `public_url`
/// without `remote_port`, or clears `remote_port` without `public_url`.
#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    pub name: Option<String>,
    pub status: Option<InstanceStatus>,
    pub status_reason: Option<String>,
    pub tunnel_connected: Option<bool>,
    pub assigned_relay: Option<Clearable<String>>,
    pub public_url: Option<Clearable<String>>,
    pub remote_port: Option<Clearable<u16>>,
    pub current_token: Option<Clearable<String>>,
    pub token_expires_at: Option<Clearable<DateTime<Utc>>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Distinguishes "leave untouched" (absent from the patch) from "set to
/// null" (`Clearable::Clear`) for nullable columns, since `Option<Option<T>>`
/// reads poorly at call sites.
#[derive(Debug, Clone)]
pub enum Clearable<T> {
    Set(T),
    Clear,
}

impl InstancePatch {
    /// The patch applied on a successful `starting -> active` relay callback.
    /// Stamps `last_heartbeat_at` to `now` so the sweeper's instance demoter
    /// gives the instance a full heartbeat-timeout window before its first
    /// real heartbeat has to arrive.
    pub fn connected(relay: String, token: String, token_expires_at: DateTime<Utc>, remote_port: u16, public_url: String, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(InstanceStatus::Active),
            status_reason: Some("tunnel connected".into()),
            tunnel_connected: Some(true),
            assigned_relay: Some(Clearable::Set(relay)),
            current_token: Some(Clearable::Set(token)),
            token_expires_at: Some(Clearable::Set(token_expires_at)),
            remote_port: Some(Clearable::Set(remote_port)),
            public_url: Some(Clearable::Set(public_url)),
            last_heartbeat_at: Some(now),
            ..Default::default()
        }
    }

    /// The patch applied on any terminal disconnect (relay callback, sweeper
    /// timeout, or instance delete pre-step): clears every connection field
    /// together so I2/I3 cannot be left in a half-updated state.
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self {
            status: Some(InstanceStatus::Offline),
            status_reason: Some(reason.into()),
            tunnel_connected: Some(false),
            public_url: Some(Clearable::Clear),
            remote_port: Some(Clearable::Clear),
            current_token: Some(Clearable::Clear),
            token_expires_at: Some(Clearable::Clear),
            ..Default::default()
        }
    }

    pub fn status_only(status: InstanceStatus, reason: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            status_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(status: InstanceStatus, tunnel_connected: bool) -> Instance {
        Instance {
            id: Uuid::nil(),
            owner: Uuid::nil(),
            name: "dev".into(),
            local_port: 8080,
            region: "us".into(),
            preferred_host: None,
            assigned_relay: None,
            status,
            status_reason: String::new(),
            tunnel_connected,
            public_url: None,
            remote_port: None,
            current_token: None,
            token_expires_at: None,
            last_heartbeat_at: None,
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
            updated_at: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    #[test]
    fn rejects_connected_without_relay() {
        let inst = sample(InstanceStatus::Active, true);
        assert!(inst.check_invariants().is_err());
    }

    #[test]
    fn rejects_offline_with_connection_fields() {
        let mut inst = sample(InstanceStatus::Offline, false);
        inst.public_url = Some("host:1".into());
        assert!(inst.check_invariants().is_err());
    }

    #[test]
    fn accepts_clean_inactive() {
        let inst = sample(InstanceStatus::Inactive, false);
        assert!(inst.check_invariants().is_ok());
    }

    #[test]
    fn disconnected_patch_clears_all_connection_fields() {
        let patch = InstancePatch::disconnected("heartbeat timeout");
        assert!(matches!(patch.public_url, Some(Clearable::Clear)));
        assert!(matches!(patch.remote_port, Some(Clearable::Clear)));
        assert!(matches!(patch.current_token, Some(Clearable::Clear)));
        assert_eq!(patch.tunnel_connected, Some(false));
    }
}
