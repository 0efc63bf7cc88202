use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The status universe for a tunnel instance.
///
/// `active` means the relay reports the tunnel connected; `online` means the
/// client is heartbeating healthily; `idle`/`degraded` are refinements of
/// "connected" reported by the heartbeat classifier; `offline` means no
/// recent heartbeat or an explicit relay disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Inactive,
    Starting,
    Active,
    Online,
    Idle,
    Degraded,
    Offline,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Inactive => "inactive",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Active => "active",
            InstanceStatus::Online => "online",
            InstanceStatus::Idle => "idle",
            InstanceStatus::Degraded => "degraded",
            InstanceStatus::Offline => "offline",
            InstanceStatus::Error => "error",
        }
    }

    /// True if the relay currently reports this instance's tunnel connected.
    pub fn is_connected_tier(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Active | InstanceStatus::Online | InstanceStatus::Idle | InstanceStatus::Degraded
        )
    }

    /// Whether `self -> target` is a legal transition per the FSM table (§4.4).
    /// The classifier and relay-callback transitions are validated separately
    /// by [`crate::fsm`] because they depend on the *trigger*, not just the
    /// source/target pair; this only rejects transitions that are never
    /// legal under any trigger.
    pub fn can_transition_to(&self, target: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (*self, target) {
            // user connect: from a rest state into starting
            (Inactive | Error | Offline, Starting) => true,
            // relay callback tunnel-connected, first time
            (Starting, Active) => true,
            // relay callback tunnel-connected, idempotent repeat
            (Active | Online | Idle | Degraded, Active) => true,
            // classifier transitions among the connected tier (and starting, pre-heartbeat)
            (Active | Online | Idle | Degraded | Starting, Online | Idle | Degraded) => true,
            // any -> offline: relay disconnect callback or sweeper timeout
            (_, Offline) => *self != Offline,
            // starting -> error: connect preconditions failed or timed out
            (Starting, Error) => true,
            _ => false,
        }
    }

    pub fn valid_transitions(&self) -> Vec<InstanceStatus> {
        use InstanceStatus::*;
        [Inactive, Starting, Active, Online, Idle, Degraded, Offline, Error]
            .into_iter()
            .filter(|s| self.can_transition_to(*s))
            .collect()
    }

    pub fn is_terminal_rest(&self) -> bool {
        matches!(self, InstanceStatus::Inactive | InstanceStatus::Error)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for InstanceStatus {
    type Error = crate::error::CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "inactive" => Ok(InstanceStatus::Inactive),
            "starting" => Ok(InstanceStatus::Starting),
            "active" => Ok(InstanceStatus::Active),
            "online" => Ok(InstanceStatus::Online),
            "idle" => Ok(InstanceStatus::Idle),
            "degraded" => Ok(InstanceStatus::Degraded),
            "offline" => Ok(InstanceStatus::Offline),
            "error" => Ok(InstanceStatus::Error),
            other => Err(crate::error::CoreError::Internal(format!(
                "unknown instance status: {other}"
            ))),
        }
    }
}

/// Append-only record of a single FSM transition, used to compute uptime and
/// reconstruct incident timelines (I6: monotonic per instance, one entry iff
/// status actually changed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub instance_id: uuid::Uuid,
    pub status: InstanceStatus,
    pub reason: String,
    pub ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_can_only_start() {
        assert_eq!(InstanceStatus::Inactive.valid_transitions(), vec![InstanceStatus::Starting]);
    }

    #[test]
    fn starting_to_active_allowed() {
        assert!(InstanceStatus::Starting.can_transition_to(InstanceStatus::Active));
    }

    #[test]
    fn active_to_active_is_idempotent() {
        assert!(InstanceStatus::Active.can_transition_to(InstanceStatus::Active));
    }

    #[test]
    fn offline_cannot_go_to_offline_again() {
        assert!(!InstanceStatus::Offline.can_transition_to(InstanceStatus::Offline));
    }

    #[test]
    fn any_connected_tier_can_go_offline() {
        for s in [InstanceStatus::Active, InstanceStatus::Online, InstanceStatus::Idle, InstanceStatus::Degraded] {
            assert!(s.can_transition_to(InstanceStatus::Offline), "{s} should be able to go offline");
        }
    }

    #[test]
    fn only_starting_can_error() {
        assert!(InstanceStatus::Starting.can_transition_to(InstanceStatus::Error));
        assert!(!InstanceStatus::Online.can_transition_to(InstanceStatus::Error));
    }

    #[test]
    fn display_matches_as_str() {
        assert_eq!(InstanceStatus::Degraded.to_string(), "degraded");
    }

    #[test]
    fn try_from_round_trips() {
        for s in [
            InstanceStatus::Inactive,
            InstanceStatus::Starting,
            InstanceStatus::Active,
            InstanceStatus::Online,
            InstanceStatus::Idle,
            InstanceStatus::Degraded,
            InstanceStatus::Offline,
            InstanceStatus::Error,
        ] {
            assert_eq!(InstanceStatus::try_from(s.as_str()).unwrap(), s);
        }
        assert!(InstanceStatus::try_from("bogus").is_err());
    }

    #[test]
    fn is_connected_tier_excludes_rest_states() {
        assert!(!InstanceStatus::Inactive.is_connected_tier());
        assert!(!InstanceStatus::Starting.is_connected_tier());
        assert!(!InstanceStatus::Offline.is_connected_tier());
        assert!(InstanceStatus::Active.is_connected_tier());
    }
}
