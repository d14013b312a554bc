//! Issues and the approval payload embedded in them.

use crate::enums::{ApprovalStatus, ApproverStatus, IssueStatus, IssueType, RiskLevel};
use changeflow_ids::{IssueName, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub uid: i64,
    pub project: ProjectId,
    /// Creator email.
    pub creator: String,
    pub title: String,
    pub description: String,
    pub issue_type: IssueType,
    pub status: IssueStatus,
    pub plan_uid: Option<i64>,
    pub pipeline_uid: Option<i64>,
    pub payload: IssuePayload,
    /// Subscriber emails.
    pub subscribers: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn name(&self) -> IssueName {
        IssueName::new(self.project.clone(), self.uid)
    }

    pub fn approval_status(&self) -> ApprovalStatus {
        self.payload.approval.status()
    }
}

/// Everything an issue carries besides its scalar columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuePayload {
    pub approval: ApprovalPayload,
    pub grant_request: Option<GrantRequest>,
    pub access_grant_uid: Option<i64>,
    pub labels: Vec<String>,
}

/// A request to amend the project IAM policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantRequest {
    /// `roles/{rid}`.
    pub role: String,
    /// `users/{email}`.
    pub user: String,
    /// Optional condition expression attached to the resulting binding.
    #[serde(default)]
    pub condition: Option<String>,
    /// Requested lifetime in seconds. Becomes a `request.time <` bound.
    #[serde(default)]
    pub expiration_secs: Option<i64>,
}

/// A linear sequence of role-gated steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalTemplate {
    pub title: String,
    pub description: String,
    pub flow: ApprovalFlow,
}

impl ApprovalTemplate {
    pub fn with_roles<I, S>(title: &str, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            title: title.to_string(),
            description: String::new(),
            flow: ApprovalFlow {
                roles: roles.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn step_count(&self) -> usize {
        self.flow.roles.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalFlow {
    /// One role per step, as `roles/{rid}`.
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approver {
    pub principal_id: i64,
    pub status: ApproverStatus,
}

/// Approval state of an issue.
///
/// `approvers[i]` records the decision taken at step `i` of `template`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalPayload {
    pub finding_done: bool,
    pub finding_error: Option<String>,
    pub template: Option<ApprovalTemplate>,
    pub approvers: Vec<Approver>,
    pub risk_level: RiskLevel,
}

impl ApprovalPayload {
    pub fn status(&self) -> ApprovalStatus {
        if !self.finding_done {
            return ApprovalStatus::Checking;
        }
        if self.finding_error.is_some() {
            return ApprovalStatus::Error;
        }
        let Some(template) = &self.template else {
            return ApprovalStatus::Skipped;
        };
        if self.is_rejected() {
            return ApprovalStatus::Rejected;
        }
        if self.approvers.len() >= template.step_count()
            && self
                .approvers
                .iter()
                .all(|a| a.status == ApproverStatus::Approved)
        {
            return ApprovalStatus::Approved;
        }
        ApprovalStatus::Pending
    }

    pub fn is_rejected(&self) -> bool {
        self.approvers
            .iter()
            .any(|a| a.status == ApproverStatus::Rejected)
    }

    /// True when nothing more is required: no template, or every step approved.
    pub fn is_approved(&self) -> bool {
        matches!(
            self.status(),
            ApprovalStatus::Approved | ApprovalStatus::Skipped
        )
    }

    /// The first step without a decision, with its role.
    pub fn next_pending_step(&self) -> Option<(usize, &str)> {
        let template = self.template.as_ref()?;
        let index = self.approvers.len();
        template
            .flow
            .roles
            .get(index)
            .map(|role| (index, role.as_str()))
    }

    /// Principal that approved the most recent step, if any.
    pub fn last_approver(&self) -> Option<i64> {
        self.approvers
            .iter()
            .rev()
            .find(|a| a.status == ApproverStatus::Approved)
            .map(|a| a.principal_id)
    }

    /// Drops every rejected approver so the flow can be re-reviewed.
    pub fn clear_rejections(&mut self) -> usize {
        let before = self.approvers.len();
        self.approvers
            .retain(|a| a.status != ApproverStatus::Rejected);
        before - self.approvers.len()
    }

    /// Forgets the previous finding so the finder resolves it again.
    pub fn reset_finding(&mut self) {
        self.finding_done = false;
        self.finding_error = None;
        self.template = None;
        self.approvers.clear();
        self.risk_level = RiskLevel::Unspecified;
    }
}
