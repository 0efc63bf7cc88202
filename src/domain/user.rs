use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Trial,
    Pro,
    Enterprise,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Trial => "trial",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }

    /// Per-user concurrent tunnel cap (I5).
    pub fn max_concurrent(&self) -> u32 {
        match self {
            Plan::Trial => 1,
            Plan::Pro => 5,
            Plan::Enterprise => 20,
        }
    }

    pub fn max_bandwidth_gb(&self) -> u32 {
        match self {
            Plan::Trial => 1,
            Plan::Pro => 50,
            Plan::Enterprise => 500,
        }
    }
}

impl TryFrom<&str> for Plan {
    type Error = crate::error::CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "trial" => Ok(Plan::Trial),
            "pro" => Ok(Plan::Pro),
            "enterprise" => Ok(Plan::Enterprise),
            other => Err(crate::error::CoreError::Validation(format!("unknown plan: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: String,
    pub plan: Plan,
    pub plan_expires: Option<DateTime<Utc>>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Plan has lapsed: trial users never expire, pro/enterprise with a past
    /// `plan_expires` are treated as trial-equivalent for quota purposes by
    /// the token broker (§4.5: "tokens are additionally rejected when the
    /// user's plan_expires < now").
    pub fn plan_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.plan_expires, Some(exp) if exp < now)
    }

    pub fn effective_plan(&self, now: DateTime<Utc>) -> Plan {
        if self.plan_expired(now) {
            Plan::Trial
        } else {
            self.plan
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_quotas_match_spec_table() {
        assert_eq!(Plan::Trial.max_concurrent(), 1);
        assert_eq!(Plan::Pro.max_concurrent(), 5);
        assert_eq!(Plan::Enterprise.max_concurrent(), 20);
    }

    #[test]
    fn plan_round_trips_through_str() {
        for p in [Plan::Trial, Plan::Pro, Plan::Enterprise] {
            assert_eq!(Plan::try_from(p.as_str()).unwrap(), p);
        }
    }
}
