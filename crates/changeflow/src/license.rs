//! Plan-tier feature gating.
//!
//! Entitlement resolution lives outside this process; the configured tier
//! is taken as given.

use changeflow_protocol::{ApiError, ApiResult, PlanTier};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    AccessGrant,
    CustomApproval,
    ExternalSecretManager,
    RolloutPolicy,
}

impl Feature {
    pub fn required_tier(self) -> PlanTier {
        match self {
            Feature::AccessGrant | Feature::ExternalSecretManager => PlanTier::Enterprise,
            Feature::CustomApproval | Feature::RolloutPolicy => PlanTier::Team,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Feature::AccessGrant => "access grant",
            Feature::CustomApproval => "custom approval",
            Feature::ExternalSecretManager => "external secret manager",
            Feature::RolloutPolicy => "rollout policy",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LicenseService {
    tier: PlanTier,
}

impl LicenseService {
    pub fn new(tier: PlanTier) -> Self {
        Self { tier }
    }

    pub fn tier(&self) -> PlanTier {
        self.tier
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.tier >= feature.required_tier()
    }

    pub fn check(&self, feature: Feature) -> ApiResult<()> {
        if self.is_enabled(feature) {
            return Ok(());
        }
        Err(ApiError::permission_denied(format!(
            "{} is not available in the {:?} plan, requires {:?}",
            feature,
            self.tier,
            feature.required_tier()
        )))
    }

    /// Maximum number of instances, `None` when unlimited.
    pub fn instance_limit(&self) -> Option<usize> {
        match self.tier {
            PlanTier::Free => Some(10),
            PlanTier::Team => Some(50),
            PlanTier::Enterprise => None,
        }
    }

    pub fn check_instance_count(&self, existing: usize) -> ApiResult<()> {
        match self.instance_limit() {
            Some(limit) if existing >= limit => Err(ApiError::resource_exhausted(format!(
                "reached the maximum instance count {} of the {:?} plan",
                limit, self.tier
            ))),
            _ => Ok(()),
        }
    }
}
