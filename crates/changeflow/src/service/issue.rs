//! Issue service: lookups, creation, updates, status changes, reviews and
//! comments.

use super::plan::{interrupt_plan_checks, schedule_plan_checks};
use super::{check_labels, check_update_mask, AppState};
use crate::comment::append_comment;
use crate::context::RequestContext;
use crate::filter::issue::apply_issue_filter;
use crate::filter::resolve_user_email;
use crate::webhook::WebhookEvent;
use changeflow_db::{IssueFind, NewIssue, NewIssueComment};
use changeflow_ids::{IssueCommentName, IssueName, PlanName, ProjectName, ProjectParent, RolloutName, UserName};
use changeflow_protocol::defaults::{MAX_COMMENT_BYTES, MAX_GRANT_LIFETIME_SECS};
use changeflow_protocol::{
    ApiError, ApiResult, CommentEvent, GrantRequest, Issue, IssueComment, IssuePayload, IssueStatus,
    IssueType, IssueUpdateEvent, Pagination, WebhookEventType,
};
use changeflow_security::{condition_environment, Permission};
use std::sync::Arc;
use tracing::{info, warn};

pub const UPDATE_ISSUE_PATHS: &[&str] = &[
    "title",
    "description",
    "subscribers",
    "labels",
    "approval_finding_done",
];

#[derive(Debug, Clone, Default)]
pub struct ListIssuesRequest {
    /// `projects/{pid}` or `projects/-`.
    pub parent: String,
    pub filter: String,
    /// Substring of the title or description.
    pub query: String,
    pub page_size: i32,
    pub page_token: String,
}

#[derive(Debug, Clone)]
pub struct CreateIssueRequest {
    pub title: String,
    pub description: String,
    pub issue_type: IssueType,
    /// `projects/{pid}/plans/{uid}`.
    pub plan: Option<String>,
    /// `projects/{pid}/rollouts/{uid}`.
    pub rollout: Option<String>,
    pub grant_request: Option<GrantRequest>,
    pub labels: Vec<String>,
    /// `users/{email}` names.
    pub subscribers: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateIssueRequest {
    pub name: String,
    pub title: String,
    pub description: String,
    pub subscribers: Vec<String>,
    pub labels: Vec<String>,
    pub approval_finding_done: bool,
}

#[derive(Debug, Clone)]
pub struct BatchUpdateIssuesStatusRequest {
    pub parent: String,
    pub issues: Vec<String>,
    pub status: IssueStatus,
    pub reason: String,
}

/// Runs the approval finder for `issue` again.
///
/// Issue types whose template is needed right away are resolved in-line,
/// and an approved grant completes immediately. Change issues are handed
/// to the background finder.
pub(crate) async fn find_approval(
    state: &AppState,
    ctx: &RequestContext,
    issue: Issue,
) -> ApiResult<Issue> {
    if !issue.issue_type.finds_approval_synchronously() {
        if issue.issue_type == IssueType::DatabaseChange {
            state.scheduler.signal_approval_check(issue.uid);
        }
        return Ok(issue);
    }
    if let Err(e) = state.approvals.find_and_apply(issue.uid).await {
        warn!(issue = issue.uid, "Approval finding failed: {}", e);
    }
    let reloaded = state
        .store
        .get_issue(issue.uid)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("issue {} not found", issue.name())))?;
    state.approvals.complete_grant_if_approved(ctx, reloaded).await
}

/// Side effects of a new issue, run after its row is committed.
pub(crate) async fn post_create(state: &AppState, ctx: &RequestContext, issue: Issue) -> ApiResult<Issue> {
    let event = WebhookEvent::for_issue(WebhookEventType::IssueCreated, ctx, &issue);
    state.webhooks.emit(event).await;
    find_approval(state, ctx, issue).await
}

#[derive(Clone)]
pub struct IssueService {
    state: Arc<AppState>,
}

impl IssueService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn get_issue(&self, ctx: &RequestContext, name: &str) -> ApiResult<Issue> {
        self.state.acl.authorize(ctx, "GetIssue", name).await?;
        self.state.issue(&IssueName::parse(name)?).await
    }

    pub async fn list_issues(
        &self,
        ctx: &RequestContext,
        request: &ListIssuesRequest,
    ) -> ApiResult<(Vec<Issue>, String)> {
        self.state
            .acl
            .authorize(ctx, "ListIssues", request.parent.as_str())
            .await?;
        self.find(ctx, request).await
    }

    /// Like [`list_issues`](Self::list_issues), but always scoped to the
    /// projects where the caller may list issues.
    pub async fn search_issues(
        &self,
        ctx: &RequestContext,
        request: &ListIssuesRequest,
    ) -> ApiResult<(Vec<Issue>, String)> {
        self.state
            .acl
            .authorize(ctx, "SearchIssues", request.parent.as_str())
            .await?;
        self.find(ctx, request).await
    }

    async fn find(
        &self,
        ctx: &RequestContext,
        request: &ListIssuesRequest,
    ) -> ApiResult<(Vec<Issue>, String)> {
        let parent = ProjectParent::parse(&request.parent)?;
        let page = Pagination::parse(request.page_size, &request.page_token)?;
        let allowed = self
            .state
            .iam
            .project_ids_filter(&ctx.principal, Permission::IssuesList)
            .await?;

        let mut find = IssueFind {
            project_ids: match (parent.project(), allowed) {
                (Some(project), Some(allowed)) => {
                    Some(allowed.into_iter().filter(|p| p == project).collect())
                }
                (Some(project), None) => Some(vec![project.clone()]),
                (None, allowed) => allowed,
            },
            limit: Some(page.fetch_limit()),
            offset: Some(page.offset),
            ..Default::default()
        };
        if !request.query.trim().is_empty() {
            find.query = Some(request.query.trim().to_string());
        }
        apply_issue_filter(&self.state.store, &request.filter, &mut find).await?;
        ctx.check()?;
        let issues = self.state.store.find_issues(&find).await?;
        Ok(page.finish(issues))
    }

    async fn subscriber_emails(&self, names: &[String]) -> ApiResult<Vec<String>> {
        let mut emails = Vec::with_capacity(names.len());
        for name in names {
            let email = resolve_user_email(&self.state.store, name).await?;
            if !emails.contains(&email) {
                emails.push(email);
            }
        }
        Ok(emails)
    }

    /// Plan and pipeline of a change or export issue.
    async fn plan_links(
        &self,
        project: &ProjectName,
        request: &CreateIssueRequest,
    ) -> ApiResult<(i64, Option<i64>)> {
        let plan_name = request
            .plan
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                ApiError::invalid_argument(format!("plan is required for {} issues", request.issue_type))
            })?;
        let plan_name = PlanName::parse(plan_name)?;
        if plan_name.project != project.project {
            return Err(ApiError::invalid_argument(format!(
                "plan {} does not belong to {}",
                plan_name, project
            )));
        }
        let plan = self
            .state
            .store
            .get_plan(plan_name.plan)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("plan {} not found", plan_name)))?;
        let pipeline = match request.rollout.as_deref().filter(|r| !r.is_empty()) {
            Some(rollout) => {
                let rollout = RolloutName::parse(rollout)?;
                let pipeline = self
                    .state
                    .store
                    .get_pipeline(rollout.rollout)
                    .await?
                    .filter(|p| p.project == project.project)
                    .ok_or_else(|| ApiError::not_found(format!("rollout {} not found", rollout)))?;
                if pipeline.plan_uid != plan.uid {
                    return Err(ApiError::invalid_argument(format!(
                        "rollout {} does not belong to plan {}",
                        rollout, plan_name
                    )));
                }
                Some(pipeline.uid)
            }
            None => plan.pipeline_uid,
        };
        Ok((plan.uid, pipeline))
    }

    fn check_grant_request(request: Option<&GrantRequest>) -> ApiResult<GrantRequest> {
        let grant = request
            .ok_or_else(|| ApiError::invalid_argument("grant request is required"))?
            .clone();
        if !grant.role.starts_with("roles/") || grant.role.len() <= "roles/".len() {
            return Err(ApiError::invalid_argument(format!(
                "invalid grant request role {:?}",
                grant.role
            )));
        }
        UserName::parse(&grant.user)?;
        if let Some(expr) = grant.condition.as_deref().filter(|c| !c.trim().is_empty()) {
            condition_environment().compile(expr).map_err(|e| {
                ApiError::invalid_argument(format!("invalid grant request condition: {}", e))
            })?;
        }
        if grant.expiration_secs.is_some_and(|s| s < 0) {
            return Err(ApiError::invalid_argument(
                "grant request expiration must not be negative",
            ));
        }
        if grant.expiration_secs.is_some_and(|s| s > MAX_GRANT_LIFETIME_SECS) {
            return Err(ApiError::invalid_argument(format!(
                "grant request expiration must not exceed {} seconds",
                MAX_GRANT_LIFETIME_SECS
            )));
        }
        Ok(grant)
    }

    pub async fn create_issue(
        &self,
        ctx: &RequestContext,
        parent: &str,
        request: &CreateIssueRequest,
    ) -> ApiResult<Issue> {
        self.state.acl.authorize(ctx, "CreateIssue", parent).await?;
        let project_name = ProjectName::parse(parent)?;
        let project = self.state.project(&project_name.project).await?;
        if request.title.trim().is_empty() {
            return Err(ApiError::invalid_argument("issue title is required"));
        }
        check_labels(&project, &request.labels)?;

        let mut new = NewIssue {
            project: project.id.clone(),
            creator: ctx.email().to_string(),
            title: request.title.clone(),
            description: request.description.clone(),
            issue_type: request.issue_type,
            plan_uid: None,
            pipeline_uid: None,
            payload: IssuePayload {
                labels: request.labels.clone(),
                ..Default::default()
            },
            subscribers: self.subscriber_emails(&request.subscribers).await?,
        };
        match request.issue_type {
            IssueType::DatabaseChange | IssueType::DatabaseDataExport => {
                let (plan, pipeline) = self.plan_links(&project_name, request).await?;
                new.plan_uid = Some(plan);
                new.pipeline_uid = pipeline;
            }
            IssueType::GrantRequest => {
                new.payload.grant_request = Some(Self::check_grant_request(request.grant_request.as_ref())?);
            }
            IssueType::AccessGrant => {
                return Err(ApiError::invalid_argument(
                    "access grant issues are created with their access grant",
                ));
            }
        }

        ctx.check()?;
        let issue = self.state.store.create_issue(&new).await?;
        info!(issue = issue.uid, user = %ctx.email(), "Issue created");
        post_create(&self.state, ctx, issue).await
    }

    async fn require_update(&self, ctx: &RequestContext, issue: &Issue) -> ApiResult<()> {
        if issue.creator == ctx.email() {
            return Ok(());
        }
        let resource = issue.name().to_string();
        self.state
            .iam
            .require(ctx, Permission::IssuesUpdate, Some(&resource))
            .await
    }

    pub async fn update_issue(
        &self,
        ctx: &RequestContext,
        request: &UpdateIssueRequest,
        update_mask: &[String],
    ) -> ApiResult<Issue> {
        self.state
            .acl
            .authorize(ctx, "UpdateIssue", request.name.as_str())
            .await?;
        check_update_mask(update_mask, UPDATE_ISSUE_PATHS)?;
        let name = IssueName::parse(&request.name)?;
        let issue = self.state.issue(&name).await?;
        self.require_update(ctx, &issue).await?;

        let mut next = issue.clone();
        let mut change = IssueUpdateEvent::default();
        let mut reset = false;
        for path in update_mask {
            match path.as_str() {
                "title" => {
                    if request.title.trim().is_empty() {
                        return Err(ApiError::invalid_argument("issue title is required"));
                    }
                    change.from_title = Some(issue.title.clone());
                    change.to_title = Some(request.title.clone());
                    next.title = request.title.clone();
                }
                "description" => {
                    change.from_description = Some(issue.description.clone());
                    change.to_description = Some(request.description.clone());
                    next.description = request.description.clone();
                }
                "subscribers" => {
                    next.subscribers = self.subscriber_emails(&request.subscribers).await?;
                }
                "labels" => {
                    check_labels(&self.state.project(&issue.project).await?, &request.labels)?;
                    change.from_labels = issue.payload.labels.clone();
                    change.to_labels = request.labels.clone();
                    next.payload.labels = request.labels.clone();
                }
                "approval_finding_done" => {
                    if request.approval_finding_done {
                        return Err(ApiError::invalid_argument(
                            "approval_finding_done can only be set to false",
                        ));
                    }
                    if issue.status != IssueStatus::Open {
                        return Err(ApiError::invalid_argument(format!(
                            "cannot reset approval finding of issue {} with status {}",
                            name, issue.status
                        )));
                    }
                    if issue.payload.approval.finding_done {
                        next.payload.approval.reset_finding();
                        reset = true;
                    }
                }
                _ => {}
            }
        }
        if next == issue {
            return Ok(issue);
        }

        ctx.check()?;
        let updated = self.state.store.update_issue(&next).await?;
        info!(issue = updated.uid, user = %ctx.email(), "Issue updated");

        if change != IssueUpdateEvent::default() {
            append_comment(
                &self.state.store,
                &updated,
                ctx.email(),
                "",
                Some(CommentEvent::IssueUpdate(change)),
            )
            .await;
        }
        let event = WebhookEvent::for_issue(WebhookEventType::IssueUpdated, ctx, &updated);
        self.state.webhooks.emit(event).await;

        if !reset {
            return Ok(updated);
        }
        if let Some(plan_uid) = updated.plan_uid {
            interrupt_plan_checks(&self.state, plan_uid).await?;
            if let Some(plan) = self.state.store.get_plan(plan_uid).await? {
                schedule_plan_checks(&self.state, &plan).await?;
            }
        }
        find_approval(&self.state, ctx, updated).await
    }

    pub async fn batch_update_issues_status(
        &self,
        ctx: &RequestContext,
        request: &BatchUpdateIssuesStatusRequest,
    ) -> ApiResult<Vec<Issue>> {
        self.state
            .acl
            .authorize(ctx, "BatchUpdateIssuesStatus", request.issues.as_slice())
            .await?;
        let parent = ProjectParent::parse(&request.parent)?;
        let mut issues = Vec::with_capacity(request.issues.len());
        for name in &request.issues {
            let name = IssueName::parse(name)?;
            if parent.project().is_some_and(|p| *p != name.project) {
                return Err(ApiError::invalid_argument(format!(
                    "issue {} does not belong to {}",
                    name, request.parent
                )));
            }
            issues.push(self.state.issue(&name).await?);
        }
        ctx.check()?;
        let updated = self
            .state
            .store
            .batch_set_issue_status(&issues, request.status)
            .await?;

        for (before, after) in issues.iter().zip(&updated) {
            if before.status == after.status {
                continue;
            }
            append_comment(
                &self.state.store,
                after,
                ctx.email(),
                &request.reason,
                Some(CommentEvent::IssueUpdate(IssueUpdateEvent::status(
                    before.status,
                    after.status,
                ))),
            )
            .await;
            let event = WebhookEvent::for_issue(WebhookEventType::IssueStatusUpdated, ctx, after)
                .with_description(request.reason.clone());
            self.state.webhooks.emit(event).await;
        }
        Ok(updated)
    }

    pub async fn approve_issue(&self, ctx: &RequestContext, name: &str, comment: &str) -> ApiResult<Issue> {
        self.state.acl.authorize(ctx, "ApproveIssue", name).await?;
        self.state.approvals.approve(ctx, &IssueName::parse(name)?, comment).await
    }

    pub async fn reject_issue(&self, ctx: &RequestContext, name: &str, comment: &str) -> ApiResult<Issue> {
        self.state.acl.authorize(ctx, "RejectIssue", name).await?;
        self.state.approvals.reject(ctx, &IssueName::parse(name)?, comment).await
    }

    pub async fn request_issue(&self, ctx: &RequestContext, name: &str, comment: &str) -> ApiResult<Issue> {
        self.state.acl.authorize(ctx, "RequestIssue", name).await?;
        self.state.approvals.request(ctx, &IssueName::parse(name)?, comment).await
    }

    // ========================================================================
    // Comments
    // ========================================================================

    pub async fn list_issue_comments(
        &self,
        ctx: &RequestContext,
        parent: &str,
        page_size: i32,
        page_token: &str,
    ) -> ApiResult<(Vec<IssueComment>, String)> {
        self.state.acl.authorize(ctx, "ListIssueComments", parent).await?;
        let issue = self.state.issue(&IssueName::parse(parent)?).await?;
        let page = Pagination::parse(page_size, page_token)?;
        let comments = self
            .state
            .store
            .list_issue_comments(issue.uid, page.fetch_limit(), page.offset)
            .await?;
        Ok(page.finish(comments))
    }

    fn check_comment_text(text: &str) -> ApiResult<()> {
        if text.trim().is_empty() {
            return Err(ApiError::invalid_argument("comment must not be empty"));
        }
        if text.len() > MAX_COMMENT_BYTES {
            return Err(ApiError::invalid_argument(format!(
                "comment exceeds {} bytes",
                MAX_COMMENT_BYTES
            )));
        }
        Ok(())
    }

    pub async fn create_issue_comment(
        &self,
        ctx: &RequestContext,
        parent: &str,
        text: &str,
    ) -> ApiResult<IssueComment> {
        self.state.acl.authorize(ctx, "CreateIssueComment", parent).await?;
        Self::check_comment_text(text)?;
        let issue = self.state.issue(&IssueName::parse(parent)?).await?;
        ctx.check()?;
        let comment = self
            .state
            .store
            .create_issue_comment(&NewIssueComment {
                project: issue.project.clone(),
                issue_uid: issue.uid,
                creator: ctx.email().to_string(),
                comment: text.to_string(),
                event: None,
            })
            .await?;
        let event = WebhookEvent::for_issue(WebhookEventType::IssueCommentCreated, ctx, &issue)
            .with_description(text);
        self.state.webhooks.emit(event).await;
        Ok(comment)
    }

    /// Replaces the text of a comment. Only its creator may edit it.
    pub async fn update_issue_comment(
        &self,
        ctx: &RequestContext,
        name: &str,
        text: &str,
        update_mask: &[String],
    ) -> ApiResult<IssueComment> {
        self.state.acl.authorize(ctx, "UpdateIssueComment", name).await?;
        check_update_mask(update_mask, &["comment"])?;
        Self::check_comment_text(text)?;
        let name = IssueCommentName::parse(name)?;
        let comment = self
            .state
            .store
            .get_issue_comment(name.comment)
            .await?
            .filter(|c| c.project == name.project && c.issue_uid == name.issue)
            .ok_or_else(|| ApiError::not_found(format!("issue comment {} not found", name)))?;
        if comment.creator != ctx.email() {
            return Err(ApiError::permission_denied(
                "only the comment creator can update the comment",
            ));
        }
        ctx.check()?;
        Ok(self.state.store.update_issue_comment_text(&comment, text).await?)
    }
}
