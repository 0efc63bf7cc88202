use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::InstanceStatus;

/// Append-only health signal carried by a heartbeat RPC; only the latest per
/// instance is consulted by the classifier (§4.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSample {
    pub instance_id: Uuid,
    pub ts: Option<DateTime<Utc>>,
    pub vscode_responsive: Option<bool>,
    pub last_activity_epoch: Option<i64>,
    pub cpu_pct: Option<f64>,
    pub mem_bytes: Option<i64>,
    pub has_code_server: Option<bool>,
}

/// The inputs the classifier needs, gathered once by the heartbeat handler
/// (§4.3) so the function itself stays pure and deterministic (P4).
#[derive(Debug, Clone, Copy)]
pub struct ClassifierInput<'a> {
    pub tunnel_connected: bool,
    pub current_status: InstanceStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub sample: Option<&'a HealthSample>,
    pub now: DateTime<Utc>,
    pub heartbeat_timeout: chrono::Duration,
    pub idle_timeout: chrono::Duration,
}

/// Deterministic classifier (§4.3): first matching rule wins. Given the same
/// `(instance, now, sample)` this always returns the same `(status, reason)`
/// (P4).
pub fn classify(input: ClassifierInput<'_>) -> (InstanceStatus, String) {
    if !input.tunnel_connected || input.current_status == InstanceStatus::Offline {
        return (InstanceStatus::Offline, "tunnel disconnected".to_string());
    }

    let stale = match input.last_heartbeat {
        None => true,
        Some(last) => input.now - last > input.heartbeat_timeout,
    };
    if stale {
        return (InstanceStatus::Offline, "heartbeat timeout".to_string());
    }

    if let Some(sample) = input.sample {
        if sample.has_code_server == Some(true) && sample.vscode_responsive == Some(false) {
            return (InstanceStatus::Degraded, "component not responding".to_string());
        }

        if let Some(last_activity) = sample.last_activity_epoch {
            if let Some(last_activity_ts) = DateTime::from_timestamp(last_activity, 0) {
                if input.now - last_activity_ts > input.idle_timeout {
                    let minutes = input.idle_timeout.num_minutes();
                    return (
                        InstanceStatus::Idle,
                        format!("no activity for over {minutes} minute(s)"),
                    );
                }
            }
        }
    }

    (InstanceStatus::Online, "all systems operational".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base(now: DateTime<Utc>) -> ClassifierInput<'static> {
        ClassifierInput {
            tunnel_connected: true,
            current_status: InstanceStatus::Active,
            last_heartbeat: Some(now),
            sample: None,
            now,
            heartbeat_timeout: Duration::seconds(30),
            idle_timeout: Duration::minutes(30),
        }
    }

    #[test]
    fn disconnected_tunnel_is_offline() {
        let now = Utc::now();
        let mut input = base(now);
        input.tunnel_connected = false;
        let (status, reason) = classify(input);
        assert_eq!(status, InstanceStatus::Offline);
        assert_eq!(reason, "tunnel disconnected");
    }

    #[test]
    fn already_offline_stays_offline() {
        let now = Utc::now();
        let mut input = base(now);
        input.current_status = InstanceStatus::Offline;
        let (status, _) = classify(input);
        assert_eq!(status, InstanceStatus::Offline);
    }

    #[test]
    fn missing_heartbeat_is_offline() {
        let now = Utc::now();
        let mut input = base(now);
        input.last_heartbeat = None;
        let (status, reason) = classify(input);
        assert_eq!(status, InstanceStatus::Offline);
        assert_eq!(reason, "heartbeat timeout");
    }

    #[test]
    fn heartbeat_just_under_timeout_is_not_offline() {
        let now = Utc::now();
        let mut input = base(now);
        input.last_heartbeat = Some(now - Duration::seconds(29));
        let (status, _) = classify(input);
        assert_ne!(status, InstanceStatus::Offline);
    }

    #[test]
    fn heartbeat_just_over_timeout_is_offline() {
        let now = Utc::now();
        let mut input = base(now);
        input.last_heartbeat = Some(now - Duration::seconds(31));
        let (status, _) = classify(input);
        assert_eq!(status, InstanceStatus::Offline);
    }

    #[test]
    fn unresponsive_code_server_is_degraded() {
        let now = Utc::now();
        let sample = HealthSample {
            has_code_server: Some(true),
            vscode_responsive: Some(false),
            ..Default::default()
        };
        let mut input = base(now);
        input.sample = Some(&sample);
        let (status, reason) = classify(input);
        assert_eq!(status, InstanceStatus::Degraded);
        assert_eq!(reason, "component not responding");
    }

    #[test]
    fn stale_activity_is_idle() {
        let now = Utc::now();
        let sample = HealthSample {
            last_activity_epoch: Some((now - Duration::minutes(31)).timestamp()),
            ..Default::default()
        };
        let mut input = base(now);
        input.sample = Some(&sample);
        let (status, reason) = classify(input);
        assert_eq!(status, InstanceStatus::Idle);
        assert!(reason.contains("30 minute"));
    }

    #[test]
    fn recent_activity_is_online() {
        let now = Utc::now();
        let sample = HealthSample {
            last_activity_epoch: Some((now - Duration::minutes(1)).timestamp()),
            ..Default::default()
        };
        let mut input = base(now);
        input.sample = Some(&sample);
        let (status, reason) = classify(input);
        assert_eq!(status, InstanceStatus::Online);
        assert_eq!(reason, "all systems operational");
    }

    #[test]
    fn no_sample_defaults_to_online() {
        let now = Utc::now();
        let (status, _) = classify(base(now));
        assert_eq!(status, InstanceStatus::Online);
    }
}
