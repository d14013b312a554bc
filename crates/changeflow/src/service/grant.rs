//! Access grant service.
//!
//! A grant is created PENDING together with an ACCESS_GRANT issue. The
//! issue's approval flow decides when the grant turns ACTIVE.

use super::issue::post_create;
use super::AppState;
use crate::context::RequestContext;
use crate::filter::grant::apply_grant_filter;
use crate::license::Feature;
use changeflow_db::{AccessGrantFind, NewAccessGrant, NewIssue};
use changeflow_ids::{AccessGrantName, DatabaseName, ProjectId, ProjectName, ProjectParent};
use changeflow_protocol::defaults::MAX_GRANT_LIFETIME_SECS;
use changeflow_protocol::{
    AccessGrant, AccessGrantPayload, AccessGrantStatus, ApiError, ApiResult, IssuePayload,
    IssueStatus, IssueType, Pagination,
};
use changeflow_security::Permission;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct CreateAccessGrantRequest {
    /// `instances/{iid}/databases/{db}` paths.
    pub targets: Vec<String>,
    pub query: bool,
    pub unmask: bool,
    pub reason: String,
    pub expire_time: Option<DateTime<Utc>>,
    pub ttl_secs: Option<i64>,
}

impl CreateAccessGrantRequest {
    fn check_expiry(&self, now: DateTime<Utc>) -> ApiResult<()> {
        match (self.expire_time, self.ttl_secs) {
            (Some(_), Some(_)) => Err(ApiError::invalid_argument(
                "only one of expire_time and ttl can be set",
            )),
            (None, None) => Err(ApiError::invalid_argument(
                "one of expire_time and ttl is required",
            )),
            (Some(at), None) if at <= now => Err(ApiError::invalid_argument(
                "expire_time must be in the future",
            )),
            (None, Some(ttl)) if ttl <= 0 => {
                Err(ApiError::invalid_argument("ttl must be positive"))
            }
            (None, Some(ttl)) if ttl > MAX_GRANT_LIFETIME_SECS => Err(ApiError::invalid_argument(
                format!("ttl must not exceed {} seconds", MAX_GRANT_LIFETIME_SECS),
            )),
            _ => Ok(()),
        }
    }

    fn title(&self) -> String {
        format!("Request access to {}", self.targets.join(", "))
    }
}

#[derive(Clone)]
pub struct AccessGrantService {
    state: Arc<AppState>,
}

impl AccessGrantService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    async fn grant(&self, name: &AccessGrantName) -> ApiResult<AccessGrant> {
        self.state
            .store
            .get_access_grant(name.grant)
            .await?
            .filter(|g| g.project == name.project)
            .ok_or_else(|| ApiError::not_found(format!("access grant {} not found", name)))
    }

    pub async fn create_access_grant(
        &self,
        ctx: &RequestContext,
        parent: &str,
        request: &CreateAccessGrantRequest,
    ) -> ApiResult<AccessGrant> {
        self.state.acl.authorize(ctx, "CreateAccessGrant", parent).await?;
        self.state.license.check(Feature::AccessGrant)?;
        let project = self.state.project(&ProjectName::parse(parent)?.project).await?;
        request.check_expiry(Utc::now())?;
        if request.targets.is_empty() {
            return Err(ApiError::invalid_argument("access grant targets are required"));
        }
        for target in &request.targets {
            let name = DatabaseName::parse(target)?;
            let db = self
                .state
                .store
                .get_database(&name)
                .await?
                .ok_or_else(|| ApiError::not_found(format!("database {} not found", name)))?;
            if db.database.project != project.id {
                return Err(ApiError::invalid_argument(format!(
                    "database {} does not belong to project {}",
                    name, project.id
                )));
            }
        }

        let grant = NewAccessGrant {
            project: project.id.clone(),
            creator: ctx.email().to_string(),
            expire_time: request.expire_time,
            ttl_secs: request.ttl_secs,
            payload: AccessGrantPayload {
                targets: request.targets.clone(),
                query: request.query,
                unmask: request.unmask,
                reason: request.reason.clone(),
                issue_uid: None,
            },
        };
        let issue = NewIssue {
            project: project.id.clone(),
            creator: ctx.email().to_string(),
            title: request.title(),
            description: request.reason.clone(),
            issue_type: IssueType::AccessGrant,
            plan_uid: None,
            pipeline_uid: None,
            payload: IssuePayload::default(),
            subscribers: Vec::new(),
        };

        ctx.check()?;
        let (grant, issue) = self
            .state
            .store
            .create_access_grant_with_issue(&grant, &issue)
            .await?;
        info!(grant = grant.uid, issue = issue.uid, user = %ctx.email(), "Access grant requested");
        post_create(&self.state, ctx, issue).await?;
        self.grant(&grant.name()).await
    }

    pub async fn get_access_grant(&self, ctx: &RequestContext, name: &str) -> ApiResult<AccessGrant> {
        self.state.acl.authorize(ctx, "GetAccessGrant", name).await?;
        self.grant(&AccessGrantName::parse(name)?).await
    }

    pub async fn list_access_grants(
        &self,
        ctx: &RequestContext,
        parent: &str,
        filter: &str,
        page_size: i32,
        page_token: &str,
    ) -> ApiResult<(Vec<AccessGrant>, String)> {
        self.state.acl.authorize(ctx, "ListAccessGrants", parent).await?;
        let parent = ProjectParent::parse(parent)?;
        let project_ids = match parent.project() {
            Some(project) => Some(vec![project.clone()]),
            None => {
                self.state
                    .iam
                    .project_ids_filter(&ctx.principal, Permission::AccessGrantsList)
                    .await?
            }
        };
        self.find(project_ids, None, filter, page_size, page_token).await
    }

    /// Grants the caller created, in any project.
    pub async fn search_my_access_grants(
        &self,
        ctx: &RequestContext,
        parent: &str,
        filter: &str,
        page_size: i32,
        page_token: &str,
    ) -> ApiResult<(Vec<AccessGrant>, String)> {
        self.state.acl.authorize(ctx, "SearchMyAccessGrants", parent).await?;
        let parent = ProjectParent::parse(parent)?;
        let project_ids = parent.project().map(|p| vec![p.clone()]);
        self.find(project_ids, Some(ctx.email().to_string()), filter, page_size, page_token)
            .await
    }

    async fn find(
        &self,
        project_ids: Option<Vec<ProjectId>>,
        creator: Option<String>,
        filter: &str,
        page_size: i32,
        page_token: &str,
    ) -> ApiResult<(Vec<AccessGrant>, String)> {
        let page = Pagination::parse(page_size, page_token)?;
        let mut find = AccessGrantFind {
            project_ids,
            limit: Some(page.fetch_limit()),
            offset: Some(page.offset),
            ..Default::default()
        };
        apply_grant_filter(&self.state.store, filter, &mut find).await?;
        if creator.is_some() {
            find.creator = creator;
        }
        let grants = self.state.store.find_access_grants(&find).await?;
        Ok(page.finish(grants))
    }

    /// PENDING -> ACTIVE. An open companion issue is completed in the same
    /// transaction so the grant and the issue never disagree.
    pub async fn activate_access_grant(&self, ctx: &RequestContext, name: &str) -> ApiResult<AccessGrant> {
        self.state.acl.authorize(ctx, "ActivateAccessGrant", name).await?;
        let name = AccessGrantName::parse(name)?;
        let grant = self.grant(&name).await?;
        if grant.status != AccessGrantStatus::Pending {
            return Err(ApiError::failed_precondition(format!(
                "access grant {} is {}, expected {}",
                name,
                grant.status,
                AccessGrantStatus::Pending
            )));
        }

        ctx.check()?;
        let issue = match grant.payload.issue_uid {
            Some(uid) => self.state.store.get_issue(uid).await?,
            None => None,
        };
        let activated = match issue.filter(|i| i.status == IssueStatus::Open) {
            Some(issue) => self.state.store.complete_access_grant(&issue).await?.0,
            None => self.state.store.activate_access_grant(grant.uid).await?,
        };
        info!(grant = activated.uid, user = %ctx.email(), "Access grant activated");
        Ok(activated)
    }

    /// ACTIVE -> REVOKED.
    pub async fn revoke_access_grant(&self, ctx: &RequestContext, name: &str) -> ApiResult<AccessGrant> {
        self.state.acl.authorize(ctx, "RevokeAccessGrant", name).await?;
        let name = AccessGrantName::parse(name)?;
        let grant = self.grant(&name).await?;
        ctx.check()?;
        let revoked = self.state.store.revoke_access_grant(grant.uid).await?;
        info!(grant = revoked.uid, user = %ctx.email(), "Access grant revoked");
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changeflow_protocol::Code;
    use chrono::Duration;

    fn request(expire_time: Option<DateTime<Utc>>, ttl_secs: Option<i64>) -> CreateAccessGrantRequest {
        CreateAccessGrantRequest {
            targets: vec!["instances/i1/databases/db1".into()],
            expire_time,
            ttl_secs,
            ..Default::default()
        }
    }

    #[test]
    fn test_expiry_exactly_one_of() {
        let now = Utc::now();
        assert!(request(None, Some(60)).check_expiry(now).is_ok());
        assert!(request(Some(now + Duration::hours(1)), None).check_expiry(now).is_ok());

        let both = request(Some(now + Duration::hours(1)), Some(60)).check_expiry(now);
        assert_eq!(both.unwrap_err().code, Code::InvalidArgument);
        assert!(request(None, None).check_expiry(now).is_err());
        assert!(request(None, Some(0)).check_expiry(now).is_err());
        assert!(request(Some(now - Duration::seconds(1)), None).check_expiry(now).is_err());
    }

    #[test]
    fn test_ttl_upper_bound() {
        let now = Utc::now();
        assert!(request(None, Some(MAX_GRANT_LIFETIME_SECS)).check_expiry(now).is_ok());
        let err = request(None, Some(i64::MAX / 1000)).check_expiry(now).unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn test_companion_issue_title() {
        let mut r = request(None, Some(60));
        r.targets.push("instances/i1/databases/db2".into());
        assert_eq!(
            r.title(),
            "Request access to instances/i1/databases/db1, instances/i1/databases/db2"
        );
    }
}
