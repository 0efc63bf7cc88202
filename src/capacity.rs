//! Capacity Admission (C7): the gate in front of instance creation and
//! connect (§4.7). Two ordered checks — system headroom, then per-user
//! quota — producing a `CapacityInfo` bundle for downstream logging on
//! success.

use serde::Serialize;
use tracing::warn;

use crate::config::CapacityConfig;
use crate::domain::{FleetStats, Plan, User};
use crate::error::{CoreError, Result};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct CapacityInfo {
    pub fleet_utilization_pct: f64,
    pub reserved_pct: f64,
    pub user_active_tunnels: i64,
    pub user_max_concurrent: u32,
}

pub struct CapacityAdmission {
    config: CapacityConfig,
}

impl CapacityAdmission {
    pub fn new(config: CapacityConfig) -> Self {
        Self { config }
    }

    /// Runs both checks in order (§4.7). `store` is queried directly rather
    /// than through the relay registry's in-memory mirror, because a stale
    /// cached view would undermine the fail-closed system check.
    pub async fn admit(&self, store: &dyn Store, user: &User) -> Result<CapacityInfo> {
        let fleet_utilization_pct = match store.list_relays().await {
            Ok(relays) => FleetStats::compute(&relays).utilization_pct,
            Err(err) => {
                warn!(error = %err, "capacity: failed to fetch fleet stats, failing closed");
                return Err(CoreError::CapacityExceeded("fleet status unavailable".into()));
            }
        };

        let headroom_pct = 100.0 - self.config.reserved_pct;
        if fleet_utilization_pct > headroom_pct {
            return Err(CoreError::CapacityExceeded(format!(
                "fleet utilization {fleet_utilization_pct:.1}% exceeds headroom {headroom_pct:.1}%"
            )));
        }

        let plan = user.effective_plan(chrono::Utc::now());
        let user_active_tunnels = store.count_user_active_tunnels(user.id).await?;
        let user_max_concurrent = plan.max_concurrent();
        if user_active_tunnels as u32 >= user_max_concurrent {
            return Err(CoreError::QuotaExceeded(format!(
                "user already has {user_active_tunnels} active tunnel(s), plan {} allows {user_max_concurrent}",
                plan.as_str()
            )));
        }

        Ok(CapacityInfo {
            fleet_utilization_pct,
            reserved_pct: self.config.reserved_pct,
            user_active_tunnels,
            user_max_concurrent,
        })
    }
}

/// Exposed for handlers that need a quota check without the system-wide
/// fleet lookup (e.g. reporting remaining quota in `GET /instances`).
pub fn quota_remaining(plan: Plan, active_count: i64) -> u32 {
    plan.max_concurrent().saturating_sub(active_count.max(0) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_remaining_saturates_at_zero() {
        assert_eq!(quota_remaining(Plan::Trial, 5), 0);
        assert_eq!(quota_remaining(Plan::Pro, 2), 3);
    }
}
