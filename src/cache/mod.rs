//! Cache (C2): the "LivenessStore" capability (§9) — a shared, ephemeral
//! key/value store with per-key TTL, primarily used for heartbeat timestamps
//! and relay load snapshots. Falls back to a process-local map on any primary
//! error, never surfacing cache failures to callers (§4.2, §7).

mod local;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redis::aio::ConnectionManager;
use tracing::{info, warn};

use local::LocalCache;

/// Shared ephemeral cache with graceful degrade-to-local-map fallback.
pub struct Cache {
    primary: Option<ConnectionManager>,
    local: LocalCache,
    degraded: AtomicBool,
}

impl Cache {
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let primary = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match client.get_tokio_connection_manager().await {
                    Ok(manager) => {
                        info!("cache: connected to redis primary");
                        Some(manager)
                    }
                    Err(err) => {
                        warn!(error = %err, "cache: failed to connect to redis, starting in degraded mode");
                        None
                    }
                },
                Err(err) => {
                    warn!(error = %err, "cache: invalid redis url, starting in degraded mode");
                    None
                }
            },
            None => {
                info!("cache: redis disabled by configuration, using local fallback only");
                None
            }
        };

        Self {
            degraded: AtomicBool::new(primary.is_none()),
            primary,
            local: LocalCache::new(),
        }
    }

    /// Write-through-both (§4.2): primary first (best effort), then local,
    /// unconditionally, so reads are correct regardless of which path they
    /// hit.
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        if let Some(primary) = &self.primary {
            let mut conn = primary.clone();
            let result: redis::RedisResult<()> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await;
            self.note_outcome(result.is_ok(), "set");
        }
        self.local.set(key, value, ttl);
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(primary) = &self.primary {
            let mut conn = primary.clone();
            let result: redis::RedisResult<Option<String>> = redis::cmd("GET").arg(key).query_async(&mut conn).await;
            match result {
                Ok(value) => {
                    self.note_outcome(true, "get");
                    if let Some(v) = value {
                        return Some(v);
                    }
                }
                Err(err) => {
                    self.note_outcome(false, "get");
                    warn!(error = %err, key, "cache: primary get failed, falling back to local");
                }
            }
        }
        self.local.get(key)
    }

    pub async fn delete(&self, key: &str) {
        if let Some(primary) = &self.primary {
            let mut conn = primary.clone();
            let result: redis::RedisResult<()> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
            self.note_outcome(result.is_ok(), "delete");
        }
        self.local.delete(key);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn note_outcome(&self, ok: bool, op: &str) {
        let was_degraded = self.degraded.swap(!ok, Ordering::Relaxed);
        if !ok && !was_degraded {
            warn!(op, "cache: primary call failed, entering degraded mode");
        } else if ok && was_degraded {
            info!(op, "cache: primary call succeeded, leaving degraded mode");
        }
    }

    /// Heartbeat key for an instance.
    pub fn heartbeat_key(instance_id: &uuid::Uuid) -> String {
        format!("heartbeat:{instance_id}")
    }

    /// Relay load snapshot key.
    pub fn relay_load_key(relay_id: &str) -> String {
        format!("relay-load:{relay_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_only_cache_round_trips() {
        let cache = Cache::connect(None).await;
        assert!(cache.is_degraded());
        cache.set("k", "v", Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));
        cache.delete("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[test]
    fn heartbeat_key_is_namespaced() {
        let id = uuid::Uuid::nil();
        assert_eq!(Cache::heartbeat_key(&id), format!("heartbeat:{id}"));
    }
}
