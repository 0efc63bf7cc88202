use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStatus {
    Active,
    Unhealthy,
    Inactive,
}

impl RelayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayStatus::Active => "active",
            RelayStatus::Unhealthy => "unhealthy",
            RelayStatus::Inactive => "inactive",
        }
    }
}

impl TryFrom<&str> for RelayStatus {
    type Error = crate::error::CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "active" => Ok(RelayStatus::Active),
            "unhealthy" => Ok(RelayStatus::Unhealthy),
            "inactive" => Ok(RelayStatus::Inactive),
            other => Err(crate::error::CoreError::Internal(format!("unknown relay status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub location: String,
    pub max_tunnels: u32,
    pub max_bw_mbps: f64,
    pub current_load: u32,
    pub current_bw_mbps: f64,
    pub status: RelayStatus,
    pub last_health_check: DateTime<Utc>,
}

impl Relay {
    /// `utilization = max(load/max_tunnels, bw/max_bw_mbps) x 100` per §4.6.
    pub fn utilization_pct(&self) -> f64 {
        let load_pct = if self.max_tunnels == 0 {
            0.0
        } else {
            self.current_load as f64 / self.max_tunnels as f64
        };
        let bw_pct = if self.max_bw_mbps <= 0.0 {
            0.0
        } else {
            self.current_bw_mbps / self.max_bw_mbps
        };
        load_pct.max(bw_pct) * 100.0
    }

    /// Advance the EMA-smoothed bandwidth estimate with a freshly reported
    /// instantaneous sample (§4.6: alpha=0.3, short window matching the
    /// probe cadence).
    pub fn observe_bandwidth(&mut self, instantaneous_mbps: f64) {
        const ALPHA: f64 = 0.3;
        self.current_bw_mbps = ALPHA * instantaneous_mbps + (1.0 - ALPHA) * self.current_bw_mbps;
    }
}

/// "Best relay" selection among active relays: minimum utilization, ties
/// broken lexicographically by id. Returns `None` for an empty candidate set.
pub fn select_best_relay(relays: &[Relay]) -> Option<&Relay> {
    relays
        .iter()
        .filter(|r| r.status == RelayStatus::Active)
        .min_by(|a, b| {
            a.utilization_pct()
                .partial_cmp(&b.utilization_pct())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySummary {
    pub id: String,
    pub location: String,
    pub utilization_pct: f64,
    pub status: RelayStatus,
}

/// Aggregate fleet view consumed by Capacity Admission and ops dashboards
/// (§4.6). Must be all-zeros, not NaN/division-by-zero, for an empty fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStats {
    pub server_count: u32,
    pub total_capacity: u32,
    pub total_load: u32,
    pub utilization_pct: f64,
    pub total_bw_gbps: f64,
    pub used_bw_gbps: f64,
    pub bw_utilization_pct: f64,
    pub servers: Vec<RelaySummary>,
}

impl FleetStats {
    pub fn compute(relays: &[Relay]) -> Self {
        let active: Vec<&Relay> = relays.iter().filter(|r| r.status == RelayStatus::Active).collect();
        if active.is_empty() {
            return Self {
                server_count: 0,
                total_capacity: 0,
                total_load: 0,
                utilization_pct: 0.0,
                total_bw_gbps: 0.0,
                used_bw_gbps: 0.0,
                bw_utilization_pct: 0.0,
                servers: Vec::new(),
            };
        }

        let total_capacity: u32 = active.iter().map(|r| r.max_tunnels).sum();
        let total_load: u32 = active.iter().map(|r| r.current_load).sum();
        let total_bw_mbps: f64 = active.iter().map(|r| r.max_bw_mbps).sum();
        let used_bw_mbps: f64 = active.iter().map(|r| r.current_bw_mbps).sum();

        Self {
            server_count: active.len() as u32,
            total_capacity,
            total_load,
            utilization_pct: if total_capacity == 0 {
                0.0
            } else {
                total_load as f64 / total_capacity as f64 * 100.0
            },
            total_bw_gbps: total_bw_mbps / 1000.0,
            used_bw_gbps: used_bw_mbps / 1000.0,
            bw_utilization_pct: if total_bw_mbps <= 0.0 { 0.0 } else { used_bw_mbps / total_bw_mbps * 100.0 },
            servers: active
                .iter()
                .map(|r| RelaySummary {
                    id: r.id.clone(),
                    location: r.location.clone(),
                    utilization_pct: r.utilization_pct(),
                    status: r.status,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(id: &str, load: u32, max_tunnels: u32, status: RelayStatus) -> Relay {
        Relay {
            id: id.into(),
            host: "h".into(),
            port: 1,
            location: "us".into(),
            max_tunnels,
            max_bw_mbps: 1000.0,
            current_load: load,
            current_bw_mbps: 0.0,
            status,
            last_health_check: Utc::now(),
        }
    }

    #[test]
    fn selects_minimum_utilization() {
        let relays = vec![
            relay("b", 8, 10, RelayStatus::Active),
            relay("a", 2, 10, RelayStatus::Active),
        ];
        assert_eq!(select_best_relay(&relays).unwrap().id, "a");
    }

    #[test]
    fn ties_broken_lexicographically() {
        let relays = vec![
            relay("zeta", 5, 10, RelayStatus::Active),
            relay("alpha", 5, 10, RelayStatus::Active),
        ];
        assert_eq!(select_best_relay(&relays).unwrap().id, "alpha");
    }

    #[test]
    fn unhealthy_relays_excluded() {
        let relays = vec![relay("only", 0, 10, RelayStatus::Unhealthy)];
        assert!(select_best_relay(&relays).is_none());
    }

    #[test]
    fn empty_fleet_selects_none() {
        assert!(select_best_relay(&[]).is_none());
    }

    #[test]
    fn empty_fleet_stats_are_zero_not_nan() {
        let stats = FleetStats::compute(&[]);
        assert_eq!(stats.server_count, 0);
        assert_eq!(stats.utilization_pct, 0.0);
        assert_eq!(stats.bw_utilization_pct, 0.0);
    }

    #[test]
    fn fleet_stats_aggregate_active_only() {
        let relays = vec![
            relay("a", 5, 10, RelayStatus::Active),
            relay("b", 100, 10, RelayStatus::Unhealthy),
        ];
        let stats = FleetStats::compute(&relays);
        assert_eq!(stats.server_count, 1);
        assert_eq!(stats.total_capacity, 10);
        assert_eq!(stats.total_load, 5);
        assert_eq!(stats.utilization_pct, 50.0);
    }

    #[test]
    fn bandwidth_ema_smooths_toward_sample() {
        let mut r = relay("a", 0, 10, RelayStatus::Active);
        r.current_bw_mbps = 100.0;
        r.observe_bandwidth(0.0);
        assert!((r.current_bw_mbps - 70.0).abs() < 1e-9);
    }
}
