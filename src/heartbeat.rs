//! Heartbeat & Health Engine (C3): the request-path half of the component —
//! the classifier itself lives in [`crate::domain::health`] so it stays a
//! pure, independently testable function (P4). This module wires it to the
//! rest of the system per the ordered steps in §4.3: stamp the cache, persist
//! the sample, classify, apply the verdict through the FSM, respond.

use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;

use crate::cache::Cache;
use crate::config::AppConfig;
use crate::domain::{classify, ClassifierInput, HealthSample, Instance, InstanceStatus};
use crate::error::Result;
use crate::fsm::InstanceFsm;
use crate::store::Store;

#[derive(Debug, Clone, serde::Serialize)]
pub struct HeartbeatOutcome {
    pub status: InstanceStatus,
    pub reason: String,
}

pub struct HeartbeatEngine {
    store: Arc<dyn Store>,
    cache: Arc<Cache>,
    fsm: Arc<InstanceFsm>,
    heartbeat_timeout: chrono::Duration,
    idle_timeout: chrono::Duration,
}

impl HeartbeatEngine {
    pub fn new(store: Arc<dyn Store>, cache: Arc<Cache>, fsm: Arc<InstanceFsm>, config: &AppConfig) -> Self {
        Self {
            store,
            cache,
            fsm,
            heartbeat_timeout: config.heartbeat_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }

    /// Processes one heartbeat RPC for `instance` (ownership already verified
    /// by the caller). `sample` is optional — a bare liveness ping with no
    /// health payload is valid and simply can't produce an `idle`/`degraded`
    /// verdict (§4.3).
    #[instrument(skip(self, sample))]
    pub async fn record(&self, instance: &Instance, sample: Option<HealthSample>) -> Result<HeartbeatOutcome> {
        let now = Utc::now();
        let cache_key = Cache::heartbeat_key(&instance.id);

        self.cache
            .set(&cache_key, &now.to_rfc3339(), (self.heartbeat_timeout * 2).to_std().unwrap_or(std::time::Duration::from_secs(60)))
            .await;

        // Persists the true last-beat signal regardless of whether the
        // classifier's verdict changes `status` — `apply_classification`
        // below no-ops on an unchanged status and never touches the row, so
        // this is the only write that keeps a steadily-heartbeating instance
        // from looking stale to the sweeper's instance demoter (§4.3, §4.9).
        self.store.touch_heartbeat(instance.id, now).await?;

        if let Some(sample) = &sample {
            self.store.save_health_sample(sample).await?;
        }

        // This call *is* the heartbeat arriving, so its own staleness check
        // against `now` is trivially satisfied; the timeout branch of the
        // classifier exists for the sweeper's instance demoter, which reads
        // `updated_at` off the row instead (§4.9) rather than calling here.
        let (status, reason) = classify(ClassifierInput {
            tunnel_connected: instance.tunnel_connected,
            current_status: instance.status,
            last_heartbeat: Some(now),
            sample: sample.as_ref(),
            now,
            heartbeat_timeout: self.heartbeat_timeout,
            idle_timeout: self.idle_timeout,
        });

        self.fsm.apply_classification(instance, status, &reason).await?;

        Ok(HeartbeatOutcome { status, reason })
    }
}

#[cfg(test)]
mod tests {
    // HeartbeatEngine's orchestration is exercised end-to-end against a live
    // Postgres + Cache in integration tests; its only pure logic (the
    // classifier itself) is covered exhaustively in `domain::health`.
}
