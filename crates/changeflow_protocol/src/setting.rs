//! Workspace settings: approval rules, risks and rollout policies.

use crate::enums::{RiskLevel, RiskSource};
use crate::issue::ApprovalTemplate;
use serde::{Deserialize, Serialize};

/// Setting keys under `settings/{name}`.
pub const SETTING_APPROVAL: &str = "workspace_approval";
pub const SETTING_WORKSPACE_POLICY: &str = "workspace_iam_policy";
pub const SETTING_RISKS: &str = "risks";
pub const SETTING_ROLLOUT_POLICIES: &str = "rollout_policies";

/// Ordered approval rules. The first rule whose condition holds wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceApprovalSetting {
    pub rules: Vec<ApprovalRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRule {
    /// Rules with a specific source only apply to issues of that source.
    #[serde(default)]
    pub source: RiskSource,
    /// Condition over `level`, `risk_level`, `source`, `issue_type` and
    /// `project_id`.
    pub condition: String,
    pub template: ApprovalTemplate,
}

/// A rule assigning a risk level to matching changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Risk {
    pub title: String,
    pub source: RiskSource,
    pub level: RiskLevel,
    /// Condition over `environment_id`, `project_id`, `database_name`,
    /// `instance_id` and `db_engine`.
    pub expression: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Who may release a stage for an environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutPolicy {
    pub automatic: bool,
    /// `roles/{rid}`, including the issue roles `roles/CREATOR` and
    /// `roles/LAST_APPROVER`.
    pub roles: Vec<String>,
}

pub const ISSUE_ROLE_CREATOR: &str = "roles/CREATOR";
pub const ISSUE_ROLE_LAST_APPROVER: &str = "roles/LAST_APPROVER";
