//! Observability counters (§4.3 note, §10): a heartbeat round-trip histogram
//! plus per-`(from, to)` status transition counters, exported in Prometheus
//! text format alongside the ops health endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::domain::InstanceStatus;

/// Upper bound (inclusive) of each heartbeat-duration bucket, milliseconds.
const BUCKET_BOUNDS_MS: [u64; 6] = [5, 10, 25, 50, 100, 250];

pub struct Metrics {
    heartbeats_total: AtomicU64,
    heartbeat_duration_sum_ms: AtomicU64,
    heartbeat_duration_buckets: [AtomicU64; BUCKET_BOUNDS_MS.len() + 1],
    transitions: DashMap<(InstanceStatus, InstanceStatus), AtomicU64>,
    breaker_rejections_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            heartbeats_total: AtomicU64::new(0),
            heartbeat_duration_sum_ms: AtomicU64::new(0),
            heartbeat_duration_buckets: Default::default(),
            transitions: DashMap::new(),
            breaker_rejections_total: AtomicU64::new(0),
        }
    }

    /// Records one heartbeat RPC's round-trip time (§4.3: measured from
    /// receipt to response, entirely within the heartbeat handler).
    pub fn record_heartbeat(&self, elapsed: Duration) {
        self.heartbeats_total.fetch_add(1, Ordering::Relaxed);
        let millis = elapsed.as_millis() as u64;
        self.heartbeat_duration_sum_ms.fetch_add(millis, Ordering::Relaxed);

        let bucket = BUCKET_BOUNDS_MS.iter().position(|&bound| millis <= bound).unwrap_or(BUCKET_BOUNDS_MS.len());
        self.heartbeat_duration_buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Records a committed FSM transition (C4 is the sole caller — every
    /// transition, including classifier-driven and sweeper-driven ones,
    /// passes through here exactly once).
    pub fn record_transition(&self, from: InstanceStatus, to: InstanceStatus) {
        self.transitions.entry((from, to)).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_rejection(&self) {
        self.breaker_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn log_status(&self) {
        debug!(
            heartbeats_total = self.heartbeats_total.load(Ordering::Relaxed),
            breaker_rejections_total = self.breaker_rejections_total.load(Ordering::Relaxed),
            "metrics: status snapshot"
        );
    }

    /// Prometheus text exposition (§10 ambient stack: counters/histograms
    /// for the ops health endpoint, not a separate `/metrics` surface —
    /// §6 Non-goals exclude a dedicated metrics endpoint, but the numbers
    /// themselves are still tracked and folded into `GET /health`).
    pub fn prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP tunnelhub_heartbeats_total Total heartbeat RPCs processed\n");
        out.push_str("# TYPE tunnelhub_heartbeats_total counter\n");
        out.push_str(&format!("tunnelhub_heartbeats_total {}\n\n", self.heartbeats_total.load(Ordering::Relaxed)));

        out.push_str("# HELP tunnelhub_heartbeat_duration_ms_sum Sum of heartbeat RPC durations in milliseconds\n");
        out.push_str("# TYPE tunnelhub_heartbeat_duration_ms_sum counter\n");
        out.push_str(&format!("tunnelhub_heartbeat_duration_ms_sum {}\n\n", self.heartbeat_duration_sum_ms.load(Ordering::Relaxed)));

        out.push_str("# HELP tunnelhub_heartbeat_duration_ms_bucket Heartbeat RPC duration histogram\n");
        out.push_str("# TYPE tunnelhub_heartbeat_duration_ms_bucket histogram\n");
        let mut cumulative = 0u64;
        for (i, bound) in BUCKET_BOUNDS_MS.iter().enumerate() {
            cumulative += self.heartbeat_duration_buckets[i].load(Ordering::Relaxed);
            out.push_str(&format!("tunnelhub_heartbeat_duration_ms_bucket{{le=\"{bound}\"}} {cumulative}\n"));
        }
        cumulative += self.heartbeat_duration_buckets[BUCKET_BOUNDS_MS.len()].load(Ordering::Relaxed);
        out.push_str(&format!("tunnelhub_heartbeat_duration_ms_bucket{{le=\"+Inf\"}} {cumulative}\n\n"));

        out.push_str("# HELP tunnelhub_transitions_total Instance FSM transitions by (from, to)\n");
        out.push_str("# TYPE tunnelhub_transitions_total counter\n");
        for entry in self.transitions.iter() {
            let (from, to) = entry.key();
            out.push_str(&format!(
                "tunnelhub_transitions_total{{from=\"{}\",to=\"{}\"}} {}\n",
                from.as_str(),
                to.as_str(),
                entry.value().load(Ordering::Relaxed)
            ));
        }
        out.push('\n');

        out.push_str("# HELP tunnelhub_breaker_rejections_total Requests rejected by an open circuit breaker\n");
        out.push_str("# TYPE tunnelhub_breaker_rejections_total counter\n");
        out.push_str(&format!("tunnelhub_breaker_rejections_total {}\n", self.breaker_rejections_total.load(Ordering::Relaxed)));

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_falls_into_correct_bucket() {
        let metrics = Metrics::new();
        metrics.record_heartbeat(Duration::from_millis(7));
        let text = metrics.prometheus();
        assert!(text.contains("tunnelhub_heartbeat_duration_ms_bucket{le=\"5\"} 0"));
        assert!(text.contains("tunnelhub_heartbeat_duration_ms_bucket{le=\"10\"} 1"));
    }

    #[test]
    fn transition_counter_keyed_by_pair() {
        let metrics = Metrics::new();
        metrics.record_transition(InstanceStatus::Starting, InstanceStatus::Active);
        metrics.record_transition(InstanceStatus::Starting, InstanceStatus::Active);
        metrics.record_transition(InstanceStatus::Active, InstanceStatus::Offline);
        let text = metrics.prometheus();
        assert!(text.contains("from=\"starting\",to=\"active\"} 2"));
        assert!(text.contains("from=\"active\",to=\"offline\"} 1"));
    }

    #[test]
    fn counts_start_at_zero() {
        let metrics = Metrics::new();
        assert_eq!(metrics.heartbeats_total.load(Ordering::Relaxed), 0);
    }
}
