//! Method-level ACL interceptor.
//!
//! Every public service method is listed in [`ACL_TABLE`] with the
//! permission it needs. Requests name their resources through
//! [`AclResources`]; the interceptor checks each one before the handler
//! runs. Methods whose permission is `None` authorize inside the handler
//! (approval steps, stage releases, own-resource lookups).

use super::IamManager;
use crate::context::RequestContext;
use changeflow_ids::{PROJECTS, WILDCARD};
use changeflow_protocol::{ApiError, ApiResult};
use changeflow_security::Permission;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct MethodAcl {
    pub method: &'static str,
    pub permission: Option<Permission>,
    /// A denial reads as NotFound so the caller learns nothing about the
    /// resource.
    pub hide_existence: bool,
}

const fn acl(method: &'static str, permission: Permission, hide_existence: bool) -> MethodAcl {
    MethodAcl {
        method,
        permission: Some(permission),
        hide_existence,
    }
}

const fn open(method: &'static str) -> MethodAcl {
    MethodAcl {
        method,
        permission: None,
        hide_existence: false,
    }
}

pub static ACL_TABLE: &[MethodAcl] = &[
    // Issues
    acl("GetIssue", Permission::IssuesGet, true),
    acl("ListIssues", Permission::IssuesList, false),
    open("SearchIssues"),
    acl("CreateIssue", Permission::IssuesCreate, false),
    open("UpdateIssue"),
    acl("BatchUpdateIssuesStatus", Permission::IssuesUpdate, false),
    open("ApproveIssue"),
    open("RejectIssue"),
    open("RequestIssue"),
    acl("ListIssueComments", Permission::IssueCommentsList, true),
    acl("CreateIssueComment", Permission::IssueCommentsCreate, false),
    acl("UpdateIssueComment", Permission::IssueCommentsUpdate, false),
    // Plans
    acl("CreatePlan", Permission::PlansCreate, false),
    acl("GetPlan", Permission::PlansGet, true),
    acl("ListPlans", Permission::PlansList, false),
    acl("UpdatePlan", Permission::PlansUpdate, false),
    acl("RunPlanChecks", Permission::PlanCheckRunsRun, false),
    acl("GetPlanCheckRun", Permission::PlanCheckRunsGet, true),
    acl("ListPlanCheckRuns", Permission::PlanCheckRunsList, false),
    acl("CancelPlanCheckRun", Permission::PlanCheckRunsRun, false),
    // Rollouts
    acl("CreateRollout", Permission::RolloutsCreate, false),
    acl("GetRollout", Permission::RolloutsGet, true),
    acl("ListTaskRuns", Permission::TaskRunsList, false),
    acl("GetTaskRun", Permission::TaskRunsList, true),
    open("BatchRunTasks"),
    open("BatchSkipTasks"),
    open("BatchCancelTaskRuns"),
    acl("UpdateTaskRunStatus", Permission::TaskRunsCreate, false),
    // Access grants
    acl("CreateAccessGrant", Permission::AccessGrantsCreate, false),
    acl("GetAccessGrant", Permission::AccessGrantsGet, true),
    acl("ListAccessGrants", Permission::AccessGrantsList, false),
    open("SearchMyAccessGrants"),
    acl("ActivateAccessGrant", Permission::AccessGrantsActivate, false),
    acl("RevokeAccessGrant", Permission::AccessGrantsRevoke, false),
    // Instances
    acl("CreateInstance", Permission::InstancesCreate, false),
    acl("GetInstance", Permission::InstancesGet, true),
    acl("SyncSlowQueries", Permission::InstancesSync, false),
];

pub fn lookup(method: &str) -> Option<&'static MethodAcl> {
    ACL_TABLE.iter().find(|m| m.method == method)
}

/// Resource paths a request touches. A wildcard parent (`projects/-`)
/// names no resource; such lists are scoped by the IAM projection instead.
pub trait AclResources {
    fn acl_resources(&self) -> Vec<String>;
}

fn is_wildcard_parent(path: &str) -> bool {
    path == format!("{}/{}", PROJECTS, WILDCARD)
}

impl AclResources for str {
    fn acl_resources(&self) -> Vec<String> {
        if is_wildcard_parent(self) {
            Vec::new()
        } else {
            vec![self.to_string()]
        }
    }
}

impl AclResources for String {
    fn acl_resources(&self) -> Vec<String> {
        self.as_str().acl_resources()
    }
}

impl AclResources for [String] {
    fn acl_resources(&self) -> Vec<String> {
        self.iter().flat_map(|p| p.acl_resources()).collect()
    }
}

impl AclResources for Vec<String> {
    fn acl_resources(&self) -> Vec<String> {
        self.as_slice().acl_resources()
    }
}

#[derive(Clone)]
pub struct AclInterceptor {
    iam: IamManager,
}

impl AclInterceptor {
    pub fn new(iam: IamManager) -> Self {
        Self { iam }
    }

    pub async fn authorize<R: AclResources + ?Sized>(
        &self,
        ctx: &RequestContext,
        method: &str,
        request: &R,
    ) -> ApiResult<()> {
        ctx.check()?;
        let acl = lookup(method)
            .ok_or_else(|| ApiError::unimplemented(format!("method {} is not implemented", method)))?;
        let Some(permission) = acl.permission else {
            return Ok(());
        };
        for resource in request.acl_resources() {
            if self
                .iam
                .check(&ctx.principal, permission, Some(&resource), None)
                .await?
            {
                continue;
            }
            debug!(method, user = %ctx.email(), %resource, "ACL denied");
            if acl.hide_existence {
                return Err(ApiError::not_found(format!("{} not found", resource)));
            }
            return Err(ApiError::permission_denied(format!(
                "user {} does not have permission {} on {}",
                ctx.email(),
                permission,
                resource
            )));
        }
        ctx.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changeflow_db::Store;
    use changeflow_ids::ProjectId;
    use changeflow_protocol::{Binding, Code, IamPolicy, Project, ProjectSettings};
    use changeflow_security::permission::ROLE_PROJECT_VIEWER;
    use changeflow_security::Principal;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[test]
    fn test_table_has_unique_methods() {
        let mut seen = HashSet::new();
        for entry in ACL_TABLE {
            assert!(seen.insert(entry.method), "duplicate {}", entry.method);
        }
        assert!(lookup("GetIssue").unwrap().hide_existence);
        assert!(lookup("ApproveIssue").unwrap().permission.is_none());
    }

    #[test]
    fn test_wildcard_parent_names_no_resource() {
        assert!("projects/-".acl_resources().is_empty());
        assert_eq!("projects/p1".acl_resources(), vec!["projects/p1".to_string()]);
    }

    async fn interceptor() -> (AclInterceptor, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("acl.db")).await.unwrap();
        store
            .create_project(&Project {
                id: ProjectId::parse("p1").unwrap(),
                title: "p1".into(),
                settings: ProjectSettings::default(),
                webhooks: Vec::new(),
                policy: IamPolicy {
                    bindings: vec![Binding {
                        role: ROLE_PROJECT_VIEWER.into(),
                        members: vec!["user:viewer@x".into()],
                        condition: None,
                    }],
                },
                deleted: false,
            })
            .await
            .unwrap();
        (AclInterceptor::new(IamManager::new(store)), dir)
    }

    #[tokio::test]
    async fn test_denial_hides_existence_for_reads() {
        let (acl, _dir) = interceptor().await;
        let viewer = RequestContext::new(Principal::new("viewer@x"));
        let stranger = RequestContext::new(Principal::new("stranger@x"));

        acl.authorize(&viewer, "GetIssue", "projects/p1/issues/1")
            .await
            .unwrap();
        let err = acl
            .authorize(&stranger, "GetIssue", "projects/p1/issues/1")
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::NotFound);

        let err = acl
            .authorize(&viewer, "CreateIssue", "projects/p1")
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);
        assert!(err.message.contains("issues.create"));
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let (acl, _dir) = interceptor().await;
        let ctx = RequestContext::new(Principal::new("viewer@x"));
        let err = acl.authorize(&ctx, "DropEverything", "projects/p1").await.unwrap_err();
        assert_eq!(err.code, Code::Unimplemented);
    }
}
