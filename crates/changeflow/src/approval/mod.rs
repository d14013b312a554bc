//! Approval engine.
//!
//! The finder resolves an issue's approval template from the workspace
//! rules once per finding. Review operations then walk the template's
//! steps in order: each step needs one approver holding the step role.
//! A fully approved grant issue completes its grant in the same call.

pub mod risk;

use crate::comment::append_comment;
use crate::context::RequestContext;
use crate::iam::IamManager;
use crate::license::{Feature, LicenseService};
use crate::webhook::{WebhookDispatcher, WebhookEvent};
use changeflow_db::Store;
use changeflow_ids::{IssueName, ProjectId, UserName, UserRef};
use changeflow_protocol::{
    ApiError, ApiResult, ApprovalRule, ApprovalStatus, ApprovalTemplate, Approver, ApproverStatus,
    CommentEvent, Condition, ErrorContext, Issue, IssueStatus, IssueType, IssueUpdateEvent, Member,
    RiskLevel, RiskSource, WebhookEventType, expiry_after,
};
use changeflow_security::cel::{Activation, CelError, Environment};
use changeflow_security::self_approval_allowed;
use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

/// Variables an approval rule condition may reference.
pub const APPROVAL_VARIABLES: &[&str] = &["level", "risk_level", "source", "issue_type", "project_id"];

fn rule_activation(
    issue_type: IssueType,
    project: &ProjectId,
    source: RiskSource,
    level: RiskLevel,
) -> Activation {
    let mut act = Activation::new();
    act.insert("level", level.tag() as i64)
        .insert("risk_level", level.as_str())
        .insert("source", source.as_str())
        .insert("issue_type", issue_type.as_str())
        .insert("project_id", project.as_str());
    act
}

/// Template of the first rule whose condition holds. Rules bound to a
/// source only apply to issues of that source.
pub fn select_template(
    rules: &[ApprovalRule],
    issue_type: IssueType,
    project: &ProjectId,
    source: RiskSource,
    level: RiskLevel,
) -> ApiResult<Option<ApprovalTemplate>> {
    let env = Environment::new(APPROVAL_VARIABLES.iter().copied());
    let act = rule_activation(issue_type, project, source, level);
    for (index, rule) in rules.iter().enumerate() {
        if rule.source != RiskSource::Unspecified && rule.source != source {
            continue;
        }
        if rule.condition.trim().is_empty() {
            continue;
        }
        let program = env.compile(&rule.condition).map_err(|e| {
            ApiError::internal(format!("failed to compile approval rule {}, error: {}", index, e))
        })?;
        match program.eval_bool(&act) {
            Ok(true) => return Ok(Some(rule.template.clone())),
            Ok(false) => {}
            Err(CelError::NoSuchKey(_)) => {}
            Err(e) => {
                return Err(ApiError::internal(format!(
                    "failed to evaluate approval rule {}, error: {}",
                    index, e
                )))
            }
        }
    }
    Ok(None)
}

/// Binding condition for a grant request: its own condition and, when an
/// expiration is set, an upper bound on `request.time`.
pub fn grant_condition(condition: Option<&str>, expiration_secs: Option<i64>) -> Option<Condition> {
    let mut parts = Vec::new();
    if let Some(expr) = condition.map(str::trim).filter(|c| !c.is_empty()) {
        parts.push(format!("({})", expr));
    }
    if let Some(secs) = expiration_secs.filter(|s| *s > 0) {
        let until = expiry_after(Utc::now(), secs).to_rfc3339_opts(SecondsFormat::Secs, true);
        parts.push(format!("request.time < timestamp(\"{}\")", until));
    }
    if parts.is_empty() {
        return None;
    }
    Some(Condition {
        expression: parts.join(" && "),
        title: String::new(),
        description: String::new(),
    })
}

#[derive(Clone)]
pub struct ApprovalEngine {
    store: Store,
    iam: IamManager,
    webhooks: WebhookDispatcher,
    license: LicenseService,
}

impl ApprovalEngine {
    pub fn new(
        store: Store,
        iam: IamManager,
        webhooks: WebhookDispatcher,
        license: LicenseService,
    ) -> Self {
        Self {
            store,
            iam,
            webhooks,
            license,
        }
    }

    async fn find_template(&self, issue: &Issue) -> ApiResult<(Option<ApprovalTemplate>, RiskLevel)> {
        let (source, level) = risk::issue_risk(&self.store, issue).await?;
        if !self.license.is_enabled(Feature::CustomApproval) {
            debug!(issue = issue.uid, "Custom approval disabled, no template");
            return Ok((None, level));
        }
        let setting = self
            .store
            .approval_setting()
            .await
            .internal_context("get approval setting")?;
        let template = select_template(&setting.rules, issue.issue_type, &issue.project, source, level)?;
        Ok((template, level))
    }

    /// Resolves and stores the approval template of an open issue whose
    /// finding is not done. Returns the updated issue, or `None` when
    /// there was nothing to do.
    pub async fn find_and_apply(&self, issue_uid: i64) -> ApiResult<Option<Issue>> {
        let Some(issue) = self.store.get_issue(issue_uid).await? else {
            debug!(issue = issue_uid, "Approval finding skipped, issue not found");
            return Ok(None);
        };
        if issue.status != IssueStatus::Open || issue.payload.approval.finding_done {
            return Ok(None);
        }
        let mut next = issue.clone();
        let approval = &mut next.payload.approval;
        match self.find_template(&issue).await {
            Ok((template, level)) => {
                approval.template = template;
                approval.risk_level = level;
            }
            Err(e) => {
                warn!(issue = issue_uid, "Approval finding failed: {}", e.message);
                approval.template = None;
                approval.finding_error = Some(e.message);
            }
        }
        approval.finding_done = true;
        approval.approvers.clear();

        let updated = self.store.update_issue(&next).await?;
        info!(
            issue = issue_uid,
            status = %updated.approval_status(),
            "Approval finding done"
        );
        self.handle_incoming_steps(&RequestContext::system(), &updated).await;
        Ok(Some(updated))
    }

    /// Announces what the approval flow now waits for: the next pending
    /// step, or the end of the flow. Returns the number of queued
    /// deliveries.
    pub async fn handle_incoming_steps(&self, ctx: &RequestContext, issue: &Issue) -> usize {
        let approval = &issue.payload.approval;
        let mut queued = 0;
        match approval.status() {
            ApprovalStatus::Pending => {
                if let Some((index, role)) = approval.next_pending_step() {
                    let event = WebhookEvent::for_issue(WebhookEventType::IssueApprovalCreated, ctx, issue)
                        .with_description(format!("step {} waits for {}", index, role))
                        .with_step(role);
                    queued += self.webhooks.emit(event).await;
                }
            }
            ApprovalStatus::Approved => {
                let event = WebhookEvent::for_issue(WebhookEventType::IssueApprovalPassed, ctx, issue);
                queued += self.webhooks.emit(event).await;
            }
            ApprovalStatus::Skipped => {}
            ApprovalStatus::Checking | ApprovalStatus::Error | ApprovalStatus::Rejected => return 0,
        }
        if approval.is_approved()
            && issue.issue_type == IssueType::DatabaseChange
            && issue.status == IssueStatus::Open
            && issue.pipeline_uid.is_some()
        {
            let event = WebhookEvent::for_issue(WebhookEventType::IssueRolloutReady, ctx, issue);
            queued += self.webhooks.emit(event).await;
        }
        queued
    }

    async fn grant_member(&self, user: &str) -> ApiResult<Member> {
        let email = match UserName::parse(user)?.user {
            UserRef::Email(email) => email,
            UserRef::Uid(uid) => self
                .store
                .get_user(uid)
                .await
                .internal_context("get user")?
                .ok_or_else(|| ApiError::not_found(format!("user {} not found", uid)))?
                .email,
        };
        Ok(Member::User(email))
    }

    /// Completes an approved grant issue: activates its access grant, or
    /// adds the requested binding to the project policy. Either way the
    /// issue becomes DONE in the same transaction.
    pub async fn complete_grant(&self, ctx: &RequestContext, issue: &Issue) -> ApiResult<Issue> {
        let done = match issue.issue_type {
            IssueType::AccessGrant => {
                let (grant, done) = self.store.complete_access_grant(issue).await?;
                info!(issue = issue.uid, grant = grant.uid, "Access grant activated on approval");
                done
            }
            IssueType::GrantRequest => {
                let request = issue.payload.grant_request.as_ref().ok_or_else(|| {
                    ApiError::internal(format!("issue {} has no grant request", issue.uid))
                })?;
                let member = self.grant_member(&request.user).await?;
                let condition = grant_condition(request.condition.as_deref(), request.expiration_secs);
                self.store
                    .complete_grant_request(issue, &request.role, &member, condition)
                    .await?
            }
            _ => return Ok(issue.clone()),
        };
        append_comment(
            &self.store,
            &done,
            ctx.email(),
            "",
            Some(CommentEvent::IssueUpdate(IssueUpdateEvent::status(
                IssueStatus::Open,
                IssueStatus::Done,
            ))),
        )
        .await;
        let event = WebhookEvent::for_issue(WebhookEventType::IssueStatusUpdated, ctx, &done);
        self.webhooks.emit(event).await;
        Ok(done)
    }

    /// Completes `issue` if it is a grant issue whose approval is done.
    pub async fn complete_grant_if_approved(&self, ctx: &RequestContext, issue: Issue) -> ApiResult<Issue> {
        if !issue.issue_type.is_grant()
            || issue.status != IssueStatus::Open
            || !issue.payload.approval.is_approved()
        {
            return Ok(issue);
        }
        self.complete_grant(ctx, &issue).await
    }

    async fn load(&self, name: &IssueName) -> ApiResult<Issue> {
        self.store
            .get_issue(name.issue)
            .await?
            .filter(|i| i.project == name.project)
            .ok_or_else(|| ApiError::not_found(format!("issue {} not found", name)))
    }

    /// The step a review acts on. Fails unless the flow waits for one.
    fn reviewable_step(issue: &Issue) -> ApiResult<(usize, String)> {
        let approval = &issue.payload.approval;
        if !approval.finding_done {
            return Err(ApiError::failed_precondition(
                "approval template finding is not done",
            ));
        }
        if let Some(err) = &approval.finding_error {
            return Err(ApiError::failed_precondition(format!(
                "approval template finding failed: {}",
                err
            )));
        }
        if approval.template.is_none() {
            return Err(ApiError::invalid_argument("issue has no approval template"));
        }
        if approval.is_rejected() {
            return Err(ApiError::invalid_argument(
                "cannot review because the review has been rejected",
            ));
        }
        if approval.status() == ApprovalStatus::Approved {
            return Err(ApiError::invalid_argument(
                "cannot review because the review has been approved",
            ));
        }
        approval
            .next_pending_step()
            .map(|(index, role)| (index, role.to_string()))
            .ok_or_else(|| ApiError::invalid_argument("no pending approval step"))
    }

    async fn require_reviewer(&self, ctx: &RequestContext, issue: &Issue, role: &str) -> ApiResult<i64> {
        let project = self
            .store
            .get_project(&issue.project)
            .await
            .internal_context("get project")?
            .ok_or_else(|| ApiError::not_found(format!("project {} not found", issue.project)))?;
        let denied = || {
            ApiError::permission_denied(format!(
                "cannot review because user {} is not a reviewer of this step",
                ctx.email()
            ))
        };
        if !self_approval_allowed(project.settings.allow_self_approval, &issue.creator, ctx.email()) {
            return Err(denied());
        }
        if !self.iam.has_role(&ctx.principal, role, &issue.project).await? {
            return Err(denied());
        }
        let user = self
            .store
            .get_user_by_email(ctx.email())
            .await
            .internal_context("get user")?
            .ok_or_else(|| ApiError::not_found(format!("user {} not found", ctx.email())))?;
        Ok(user.uid)
    }

    async fn review(
        &self,
        ctx: &RequestContext,
        name: &IssueName,
        comment: &str,
        status: ApproverStatus,
    ) -> ApiResult<Issue> {
        let issue = self.load(name).await?;
        if issue.status != IssueStatus::Open {
            return Err(ApiError::invalid_argument(format!(
                "cannot review issue {} with status {}",
                name, issue.status
            )));
        }
        let (index, role) = Self::reviewable_step(&issue)?;
        let principal_id = self.require_reviewer(ctx, &issue, &role).await?;

        let mut next = issue.clone();
        next.payload.approval.approvers.push(Approver { principal_id, status });
        ctx.check()?;
        let updated = self.store.update_issue(&next).await?;
        info!(issue = issue.uid, step = index, user = %ctx.email(), "Issue review {}", status);

        append_comment(
            &self.store,
            &updated,
            ctx.email(),
            comment,
            Some(CommentEvent::Approval { status }),
        )
        .await;
        self.handle_incoming_steps(ctx, &updated).await;
        Ok(updated)
    }

    pub async fn approve(&self, ctx: &RequestContext, name: &IssueName, comment: &str) -> ApiResult<Issue> {
        let updated = self.review(ctx, name, comment, ApproverStatus::Approved).await?;
        self.complete_grant_if_approved(ctx, updated).await
    }

    pub async fn reject(&self, ctx: &RequestContext, name: &IssueName, comment: &str) -> ApiResult<Issue> {
        self.review(ctx, name, comment, ApproverStatus::Rejected).await
    }

    /// Re-requests review of a rejected flow. Only the creator may ask.
    pub async fn request(&self, ctx: &RequestContext, name: &IssueName, comment: &str) -> ApiResult<Issue> {
        let issue = self.load(name).await?;
        if issue.creator != ctx.email() {
            return Err(ApiError::permission_denied(
                "only the issue creator can request review",
            ));
        }
        if issue.status != IssueStatus::Open {
            return Err(ApiError::invalid_argument(format!(
                "cannot request review of issue {} with status {}",
                name, issue.status
            )));
        }
        if !issue.payload.approval.is_rejected() {
            return Err(ApiError::invalid_argument(
                "cannot request issues because the review is not rejected",
            ));
        }
        let mut next = issue.clone();
        let dropped = next.payload.approval.clear_rejections();
        ctx.check()?;
        let updated = self.store.update_issue(&next).await?;
        info!(issue = issue.uid, dropped, "Issue review re-requested");

        append_comment(
            &self.store,
            &updated,
            ctx.email(),
            comment,
            Some(CommentEvent::Approval {
                status: ApproverStatus::Pending,
            }),
        )
        .await;
        self.handle_incoming_steps(ctx, &updated).await;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(source: RiskSource, condition: &str, roles: &[&str]) -> ApprovalRule {
        ApprovalRule {
            source,
            condition: condition.into(),
            template: ApprovalTemplate::with_roles("t", roles.iter().copied()),
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = vec![
            rule(RiskSource::Unspecified, "", &["roles/ignored"]),
            rule(RiskSource::Dml, "true", &["roles/dml"]),
            rule(RiskSource::Unspecified, "level >= 300", &["roles/high"]),
            rule(RiskSource::Ddl, "risk_level == \"HIGH\"", &["roles/ddl-high"]),
        ];
        let project = ProjectId::parse("p1").unwrap();
        let found = select_template(
            &rules,
            IssueType::DatabaseChange,
            &project,
            RiskSource::Ddl,
            RiskLevel::High,
        )
        .unwrap()
        .unwrap();
        assert_eq!(found.flow.roles, vec!["roles/high".to_string()]);

        let none = select_template(
            &rules,
            IssueType::DatabaseChange,
            &project,
            RiskSource::Ddl,
            RiskLevel::Low,
        )
        .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_rule_conditions_see_issue_type_and_project() {
        let rules = vec![rule(
            RiskSource::Unspecified,
            "issue_type == \"ACCESS_GRANT\" && project_id == \"p1\"",
            &["roles/projectOwner"],
        )];
        let project = ProjectId::parse("p1").unwrap();
        assert!(select_template(&rules, IssueType::AccessGrant, &project, RiskSource::RequestAccess, RiskLevel::Unspecified)
            .unwrap()
            .is_some());
        let other = ProjectId::parse("p2").unwrap();
        assert!(select_template(&rules, IssueType::AccessGrant, &other, RiskSource::RequestAccess, RiskLevel::Unspecified)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_undeclared_rule_variable_is_error() {
        let rules = vec![rule(RiskSource::Unspecified, "owner == \"x\"", &["roles/a"])];
        let project = ProjectId::parse("p1").unwrap();
        assert!(select_template(&rules, IssueType::DatabaseChange, &project, RiskSource::Ddl, RiskLevel::Low).is_err());
    }

    #[test]
    fn test_grant_condition_combines_parts() {
        assert!(grant_condition(None, None).is_none());
        assert!(grant_condition(Some("  "), Some(0)).is_none());

        let only = grant_condition(Some("resource.database == \"d1\""), None).unwrap();
        assert_eq!(only.expression, "(resource.database == \"d1\")");

        let far = grant_condition(None, Some(i64::MAX)).unwrap();
        assert!(changeflow_security::condition_environment()
            .compile(&far.expression)
            .is_ok());

        let both = grant_condition(Some("resource.database == \"d1\""), Some(3600)).unwrap();
        assert!(both.expression.starts_with("(resource.database == \"d1\") && request.time < timestamp(\""));
        assert!(changeflow_security::condition_environment()
            .compile(&both.expression)
            .is_ok());
    }
}
