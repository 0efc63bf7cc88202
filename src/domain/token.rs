use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, single-use-per-instance tunnel credential (I1: at most one active
/// row per instance at any time; the Store enforces this by deleting any
/// prior row in the same transaction that inserts a new one).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelToken {
    pub token: String,
    pub instance_id: Uuid,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TunnelToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Refresh tokens share the row shape with tunnel tokens but live in a
/// distinct table (§4.1); they are out of scope for the core FSM but the
/// Store exposes the same delete-on-logout-all primitive for both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Verdict returned to relays by the validation endpoint (§4.5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenValidation {
    pub valid: bool,
    pub usage_allowed: bool,
    pub user_id: Option<Uuid>,
    pub plan_type: Option<String>,
    pub max_concurrent: Option<u32>,
    pub max_bandwidth_gb: Option<u32>,
    pub instance_id: Option<Uuid>,
    pub message: String,
}

impl TokenValidation {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            usage_allowed: false,
            user_id: None,
            plan_type: None,
            max_concurrent: None,
            max_bandwidth_gb: None,
            instance_id: None,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn expired_token_detected() {
        let now = Utc::now();
        let token = TunnelToken {
            token: "x".into(),
            instance_id: Uuid::nil(),
            user_id: Uuid::nil(),
            expires_at: now - Duration::seconds(1),
            created_at: now - Duration::hours(1),
        };
        assert!(token.is_expired(now));
    }

    #[test]
    fn fresh_token_not_expired() {
        let now = Utc::now();
        let token = TunnelToken {
            token: "x".into(),
            instance_id: Uuid::nil(),
            user_id: Uuid::nil(),
            expires_at: now + Duration::hours(1),
            created_at: now,
        };
        assert!(!token.is_expired(now));
    }
}
