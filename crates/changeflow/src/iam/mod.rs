//! IAM gate: permission checks against workspace and project policies.

pub mod acl;

pub use acl::{AclInterceptor, AclResources, MethodAcl, ACL_TABLE};

use crate::context::RequestContext;
use changeflow_db::Store;
use changeflow_ids::{project_of, ProjectId};
use changeflow_protocol::{ApiError, ApiResult, ErrorContext, IamPolicy};
use changeflow_security::{
    request_activation, Activation, Permission, PolicyEvaluator, Principal, RoleCatalogue,
};
use chrono::Utc;
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Clone)]
pub struct IamManager {
    store: Store,
}

impl IamManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Resolves a principal with its group memberships.
    pub async fn principal(&self, email: &str) -> ApiResult<Principal> {
        let groups = self
            .store
            .list_groups_for_member(email)
            .await
            .internal_context("list groups")?;
        Ok(Principal::new(email).with_groups(groups.into_iter().map(|g| g.email).collect()))
    }

    async fn catalogue(&self) -> ApiResult<RoleCatalogue> {
        let custom = self.store.list_roles().await.internal_context("list roles")?;
        Ok(RoleCatalogue::with_custom(&custom))
    }

    async fn policies(
        &self,
        project: Option<&ProjectId>,
    ) -> ApiResult<(IamPolicy, Option<IamPolicy>)> {
        let workspace = self
            .store
            .workspace_policy()
            .await
            .internal_context("get workspace policy")?;
        let project = match project {
            Some(id) => self
                .store
                .get_project(id)
                .await
                .internal_context("get project")?
                .filter(|p| !p.deleted)
                .map(|p| p.policy),
            None => None,
        };
        Ok((workspace, project))
    }

    fn attributes(extra: Option<&Activation>) -> Activation {
        let mut attrs = request_activation(Utc::now());
        if let Some(extra) = extra {
            attrs.merge(extra);
        }
        attrs
    }

    /// Whether `principal` holds `permission` on `resource`. A resource
    /// under `projects/{pid}` also consults that project's policy.
    pub async fn check(
        &self,
        principal: &Principal,
        permission: Permission,
        resource: Option<&str>,
        extra: Option<&Activation>,
    ) -> ApiResult<bool> {
        let project = resource.and_then(project_of);
        let (workspace, project_policy) = self.policies(project.as_ref()).await?;
        let catalogue = self.catalogue().await?;
        let allowed = PolicyEvaluator::new(&catalogue)
            .check(
                principal,
                permission,
                &workspace,
                project_policy.as_ref(),
                &Self::attributes(extra),
            )
            .internal_context("evaluate IAM policy")?;
        debug!(
            user = %principal.email,
            permission = %permission,
            resource = resource.unwrap_or("workspace"),
            allowed,
            "IAM check"
        );
        Ok(allowed)
    }

    /// Like [`check`](Self::check) but turns a denial into PermissionDenied.
    pub async fn require(
        &self,
        ctx: &RequestContext,
        permission: Permission,
        resource: Option<&str>,
    ) -> ApiResult<()> {
        if self.check(&ctx.principal, permission, resource, None).await? {
            return Ok(());
        }
        Err(ApiError::permission_denied(format!(
            "user {} does not have permission {}",
            ctx.email(),
            permission
        )))
    }

    /// Roles the principal holds through the workspace policy and, when
    /// given, the project's policy.
    pub async fn roles(
        &self,
        principal: &Principal,
        project: Option<&ProjectId>,
    ) -> ApiResult<BTreeSet<String>> {
        let (workspace, project_policy) = self.policies(project).await?;
        let catalogue = self.catalogue().await?;
        PolicyEvaluator::new(&catalogue)
            .roles(
                principal,
                &workspace,
                project_policy.as_ref(),
                &Self::attributes(None),
            )
            .internal_context("evaluate IAM policy")
    }

    pub async fn has_role(
        &self,
        principal: &Principal,
        role: &str,
        project: &ProjectId,
    ) -> ApiResult<bool> {
        Ok(self.roles(principal, Some(project)).await?.contains(role))
    }

    /// Projection for list and search: `None` when the principal holds the
    /// permission workspace-wide, otherwise the projects where it does.
    pub async fn project_ids_filter(
        &self,
        principal: &Principal,
        permission: Permission,
    ) -> ApiResult<Option<Vec<ProjectId>>> {
        if self.check(principal, permission, None, None).await? {
            return Ok(None);
        }
        let projects = self.store.list_projects().await.internal_context("list projects")?;
        let mut allowed = Vec::new();
        for project in projects.into_iter().filter(|p| !p.deleted) {
            let path = format!("projects/{}", project.id);
            if self.check(principal, permission, Some(&path), None).await? {
                allowed.push(project.id);
            }
        }
        Ok(Some(allowed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changeflow_protocol::{Binding, Condition, Group, Project, ProjectSettings};
    use changeflow_security::permission::{ROLE_PROJECT_DEVELOPER, ROLE_WORKSPACE_ADMIN};
    use tempfile::TempDir;

    fn binding(role: &str, member: &str, condition: Option<&str>) -> Binding {
        Binding {
            role: role.to_string(),
            members: vec![member.to_string()],
            condition: condition.map(|e| Condition {
                expression: e.to_string(),
                ..Default::default()
            }),
        }
    }

    async fn seeded() -> (IamManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("iam.db")).await.unwrap();
        for id in ["p1", "p2"] {
            store
                .create_project(&Project {
                    id: ProjectId::parse(id).unwrap(),
                    title: id.to_string(),
                    settings: ProjectSettings::default(),
                    webhooks: Vec::new(),
                    policy: IamPolicy::default(),
                    deleted: false,
                })
                .await
                .unwrap();
        }
        store
            .set_workspace_policy(&IamPolicy {
                bindings: vec![binding(ROLE_WORKSPACE_ADMIN, "user:root@x", None)],
            })
            .await
            .unwrap();
        store
            .set_project_policy(
                &ProjectId::parse("p1").unwrap(),
                &IamPolicy {
                    bindings: vec![
                        binding(ROLE_PROJECT_DEVELOPER, "group:devs@x", None),
                        binding(
                            ROLE_PROJECT_DEVELOPER,
                            "user:late@x",
                            Some("request.time < timestamp(\"2000-01-01T00:00:00Z\")"),
                        ),
                    ],
                },
            )
            .await
            .unwrap();
        store
            .upsert_group(&Group {
                email: "devs@x".into(),
                title: "devs".into(),
                members: vec!["bob@x".into()],
            })
            .await
            .unwrap();
        (IamManager::new(store), dir)
    }

    #[tokio::test]
    async fn test_group_membership_grants_project_permission() {
        let (iam, _dir) = seeded().await;
        let bob = iam.principal("bob@x").await.unwrap();
        assert_eq!(bob.groups, vec!["devs@x".to_string()]);
        assert!(iam
            .check(&bob, Permission::IssuesCreate, Some("projects/p1/issues/1"), None)
            .await
            .unwrap());
        assert!(!iam
            .check(&bob, Permission::IssuesCreate, Some("projects/p2"), None)
            .await
            .unwrap());
        assert!(!iam.check(&bob, Permission::IssuesCreate, None, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_condition_leaves_binding_inactive() {
        let (iam, _dir) = seeded().await;
        let late = iam.principal("late@x").await.unwrap();
        assert!(!iam
            .check(&late, Permission::IssuesGet, Some("projects/p1"), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_project_ids_filter() {
        let (iam, _dir) = seeded().await;
        let root = iam.principal("root@x").await.unwrap();
        assert_eq!(
            iam.project_ids_filter(&root, Permission::IssuesList).await.unwrap(),
            None
        );
        let bob = iam.principal("bob@x").await.unwrap();
        assert_eq!(
            iam.project_ids_filter(&bob, Permission::IssuesList).await.unwrap(),
            Some(vec![ProjectId::parse("p1").unwrap()])
        );
        let stranger = iam.principal("nobody@x").await.unwrap();
        assert_eq!(
            iam.project_ids_filter(&stranger, Permission::IssuesList)
                .await
                .unwrap(),
            Some(Vec::new())
        );
    }
}
