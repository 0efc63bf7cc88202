//! Tunnel-Token Broker (C5): mints single-use opaque credentials consumed by
//! relays to authorize inbound client tunnels (§4.5). Tied to the instance
//! FSM for rotation (one active token per instance, I1) and revocation.

use std::sync::Arc;

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::domain::{TokenValidation, TunnelToken, User};
use crate::error::Result;
use crate::store::Store;

pub struct TokenBroker {
    store: Arc<dyn Store>,
    ttl: chrono::Duration,
}

impl TokenBroker {
    pub fn new(store: Arc<dyn Store>, config: &AppConfig) -> Self {
        Self { store, ttl: config.tunnel_token_ttl() }
    }

    /// 256 bits of entropy from `OsRng`, hex-encoded to 64 characters (§4.5).
    fn generate_opaque_token() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Mints a fresh token for `instance_id`/`user_id`, atomically replacing
    /// any prior token for the instance (I1; the Store deletes-then-inserts
    /// inside one transaction). Does not touch the instance row — the FSM
    /// (C4) is responsible for writing `current_token`/`token_expires_at`
    /// onto the instance in the same transaction as its own patch.
    pub async fn mint(&self, instance_id: uuid::Uuid, user_id: uuid::Uuid) -> Result<TunnelToken> {
        let now = Utc::now();
        let token = TunnelToken {
            token: Self::generate_opaque_token(),
            instance_id,
            user_id,
            expires_at: now + self.ttl,
            created_at: now,
        };
        self.store.save_tunnel_token(&token).await?;
        info!(instance_id = %instance_id, "token_broker: minted tunnel token");
        Ok(token)
    }

    /// Relay-facing validation endpoint (§4.5, §6). Negative verdicts fire a
    /// best-effort delete of the invalid token so a expired/malformed token
    /// can never be validated twice.
    pub async fn validate(&self, token: &str) -> Result<TokenValidation> {
        let record = match self.store.get_tunnel_token(token).await? {
            Some(record) => record,
            None => return Ok(TokenValidation::invalid("token not found")),
        };

        let now = Utc::now();
        if record.is_expired(now) {
            self.delete_best_effort(token).await;
            return Ok(TokenValidation::invalid("token expired"));
        }

        let user = match self.store.get_user_by_id(record.user_id).await? {
            Some(user) => user,
            None => {
                self.delete_best_effort(token).await;
                return Ok(TokenValidation::invalid("owning user no longer exists"));
            }
        };

        if user.plan_expired(now) {
            self.delete_best_effort(token).await;
            return Ok(TokenValidation::invalid("user's plan has expired"));
        }

        Ok(self.positive_verdict(&user, record.instance_id))
    }

    fn positive_verdict(&self, user: &User, instance_id: uuid::Uuid) -> TokenValidation {
        let plan = user.effective_plan(Utc::now());
        TokenValidation {
            valid: true,
            usage_allowed: true,
            user_id: Some(user.id),
            plan_type: Some(plan.as_str().to_string()),
            max_concurrent: Some(plan.max_concurrent()),
            max_bandwidth_gb: Some(plan.max_bandwidth_gb()),
            instance_id: Some(instance_id),
            message: "token valid".to_string(),
        }
    }

    async fn delete_best_effort(&self, token: &str) {
        if let Err(err) = self.store.delete_tunnel_token(token).await {
            warn!(error = %err, "token_broker: best-effort delete of invalid token failed");
        }
    }

    /// Revokes the active token for an instance (disconnect, instance
    /// delete). Best-effort by design (§4.5): a failure here must not block
    /// the FSM transition that called it, since the instance row itself is
    /// the authority on connectivity.
    pub async fn revoke_for_instance(&self, instance_id: uuid::Uuid) -> Result<()> {
        self.store.delete_tunnel_token_for_instance(instance_id).await
    }

    /// Revokes every tunnel token owned by a user (logout-all, §4.5).
    pub async fn revoke_for_user(&self, user_id: uuid::Uuid) -> Result<()> {
        self.store.delete_user_tunnel_tokens(user_id).await
    }

    /// Background sweeper's token reaper (§4.9): deletes every tunnel token
    /// past its `expires_at`. Returns the count reaped for logging.
    pub async fn reap_expired(&self) -> Result<u64> {
        self.store.reap_expired_tunnel_tokens().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_64_hex_chars_of_256_bits() {
        let token = TokenBroker::generate_opaque_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_tokens_are_unique() {
        let a = TokenBroker::generate_opaque_token();
        let b = TokenBroker::generate_opaque_token();
        assert_ne!(a, b);
    }
}
