//! API services.
//!
//! Each service is a thin handle over the shared [`AppState`]. Every public
//! method takes the caller's [`RequestContext`] first and runs the ACL
//! interceptor before it reads anything.

pub mod grant;
pub mod instance;
pub mod issue;
pub mod plan;
pub mod rollout;

pub use grant::{AccessGrantService, CreateAccessGrantRequest};
pub use instance::InstanceService;
pub use issue::{
    BatchUpdateIssuesStatusRequest, CreateIssueRequest, IssueService, ListIssuesRequest,
    UpdateIssueRequest,
};
pub use plan::{CreatePlanRequest, PlanService, UpdatePlanRequest};
pub use rollout::{RolloutService, UpdateTaskRunStatusRequest};

use crate::approval::ApprovalEngine;
use crate::context::RequestContext;
use crate::iam::{AclInterceptor, IamManager};
use crate::license::LicenseService;
use crate::webhook::WebhookDispatcher;
use changeflow_db::Store;
use changeflow_ids::{IssueName, ProjectId};
use changeflow_protocol::{ApiError, ApiResult, Issue, Project, SystemConfig};
use changeflow_sentinel::{Scheduler, SignalBus};
use std::sync::Arc;

/// Everything a service needs, built once by the process root.
pub struct AppState {
    pub store: Store,
    pub scheduler: Arc<Scheduler>,
    pub iam: IamManager,
    pub acl: AclInterceptor,
    pub webhooks: WebhookDispatcher,
    pub signals: SignalBus,
    pub license: LicenseService,
    pub approvals: ApprovalEngine,
    pub config: SystemConfig,
}

impl AppState {
    pub fn new(store: Store, config: SystemConfig) -> Arc<Self> {
        let scheduler = Arc::new(Scheduler::new(config.channel_capacity));
        let iam = IamManager::new(store.clone());
        let webhooks = WebhookDispatcher::new(store.clone(), config.channel_capacity);
        let license = LicenseService::new(config.plan);
        let approvals =
            ApprovalEngine::new(store.clone(), iam.clone(), webhooks.clone(), license);
        Arc::new(Self {
            signals: SignalBus::new(store.clone(), config.replica_id.clone()),
            acl: AclInterceptor::new(iam.clone()),
            store,
            scheduler,
            iam,
            webhooks,
            license,
            approvals,
            config,
        })
    }

    pub fn issues(self: &Arc<Self>) -> IssueService {
        IssueService::new(self.clone())
    }

    pub fn plans(self: &Arc<Self>) -> PlanService {
        PlanService::new(self.clone())
    }

    pub fn rollouts(self: &Arc<Self>) -> RolloutService {
        RolloutService::new(self.clone())
    }

    pub fn access_grants(self: &Arc<Self>) -> AccessGrantService {
        AccessGrantService::new(self.clone())
    }

    pub fn instances(self: &Arc<Self>) -> InstanceService {
        InstanceService::new(self.clone())
    }

    /// Context for `email`, with group memberships resolved.
    pub async fn context(&self, email: &str) -> ApiResult<RequestContext> {
        Ok(RequestContext::new(self.iam.principal(email).await?))
    }

    pub(crate) async fn project(&self, id: &ProjectId) -> ApiResult<Project> {
        self.store
            .get_project(id)
            .await?
            .filter(|p| !p.deleted)
            .ok_or_else(|| ApiError::not_found(format!("project {} not found", id)))
    }

    /// The issue behind `name`. An issue of another project is NotFound.
    pub(crate) async fn issue(&self, name: &IssueName) -> ApiResult<Issue> {
        self.store
            .get_issue(name.issue)
            .await?
            .filter(|i| i.project == name.project)
            .ok_or_else(|| ApiError::not_found(format!("issue {} not found", name)))
    }
}

/// Rejects an empty mask and any path outside `allowed`.
pub(crate) fn check_update_mask(paths: &[String], allowed: &[&str]) -> ApiResult<()> {
    if paths.is_empty() {
        return Err(ApiError::invalid_argument("update_mask must be set"));
    }
    for path in paths {
        if !allowed.contains(&path.as_str()) {
            return Err(ApiError::invalid_argument(format!(
                "unsupported update_mask path {:?}",
                path
            )));
        }
    }
    Ok(())
}

/// Labels must satisfy the project's label settings.
pub(crate) fn check_labels(project: &Project, labels: &[String]) -> ApiResult<()> {
    let settings = &project.settings;
    if settings.force_issue_labels && labels.is_empty() {
        return Err(ApiError::invalid_argument(format!(
            "project {} requires issue labels",
            project.id
        )));
    }
    if settings.issue_labels.is_empty() {
        return Ok(());
    }
    match labels.iter().find(|l| !settings.issue_labels.contains(l)) {
        Some(label) => Err(ApiError::invalid_argument(format!(
            "label {:?} is not allowed in project {}",
            label, project.id
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changeflow_protocol::{Code, IamPolicy, ProjectSettings};

    fn project(force: bool, allowed: &[&str]) -> Project {
        Project {
            id: ProjectId::parse("p1").unwrap(),
            title: "p1".into(),
            settings: ProjectSettings {
                force_issue_labels: force,
                issue_labels: allowed.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            webhooks: Vec::new(),
            policy: IamPolicy::default(),
            deleted: false,
        }
    }

    #[test]
    fn test_update_mask_paths() {
        assert_eq!(
            check_update_mask(&[], &["title"]).unwrap_err().code,
            Code::InvalidArgument
        );
        assert!(check_update_mask(&["title".into()], &["title", "description"]).is_ok());
        let err = check_update_mask(&["creator".into()], &["title"]).unwrap_err();
        assert!(err.message.contains("creator"));
    }

    #[test]
    fn test_label_settings() {
        assert!(check_labels(&project(false, &[]), &[]).is_ok());
        assert!(check_labels(&project(true, &[]), &[]).is_err());
        let p = project(false, &["bug", "feature"]);
        assert!(check_labels(&p, &["bug".into()]).is_ok());
        assert!(check_labels(&p, &["chore".into()]).is_err());
    }
}
