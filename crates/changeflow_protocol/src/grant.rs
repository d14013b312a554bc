//! Time-bounded access grants.

use crate::defaults::MAX_GRANT_LIFETIME_SECS;
use crate::enums::AccessGrantStatus;
use changeflow_ids::{AccessGrantName, ProjectId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub uid: i64,
    pub project: ProjectId,
    pub creator: String,
    pub status: AccessGrantStatus,
    /// Absolute expiry. Always set while `ACTIVE`.
    pub expire_time: Option<DateTime<Utc>>,
    /// Requested lifetime, resolved into `expire_time` at activation.
    pub ttl_secs: Option<i64>,
    pub payload: AccessGrantPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccessGrant {
    pub fn name(&self) -> AccessGrantName {
        AccessGrantName::new(self.project.clone(), self.uid)
    }

    /// Expiry to persist when the grant is activated at `now`.
    pub fn expire_time_at_activation(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match (self.expire_time, self.ttl_secs) {
            (Some(explicit), _) => Some(explicit),
            (None, Some(ttl)) => Some(expiry_after(now, ttl)),
            (None, None) => None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time.is_some_and(|t| t <= now)
    }
}

/// `now` plus `secs`, with `secs` clamped to [`MAX_GRANT_LIFETIME_SECS`].
pub fn expiry_after(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    Duration::try_seconds(secs.min(MAX_GRANT_LIFETIME_SECS))
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessGrantPayload {
    /// Resource paths, usually `instances/{iid}/databases/{db}`.
    pub targets: Vec<String>,
    pub query: bool,
    pub unmask: bool,
    pub reason: String,
    pub issue_uid: Option<i64>,
}
