//! Permissions and the predefined role catalogue.

use changeflow_protocol::Role;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

macro_rules! permissions {
    ($($variant:ident => $id:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Permission {
            $($variant),*
        }

        impl Permission {
            pub const ALL: &'static [Permission] = &[$(Permission::$variant),*];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Permission::$variant => $id),*
                }
            }
        }

        impl FromStr for Permission {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($id => Ok(Permission::$variant),)*
                    other => Err(format!("unknown permission: {}", other)),
                }
            }
        }
    };
}

permissions! {
    AccessGrantsActivate => "accessGrants.activate",
    AccessGrantsCreate => "accessGrants.create",
    AccessGrantsGet => "accessGrants.get",
    AccessGrantsList => "accessGrants.list",
    AccessGrantsRevoke => "accessGrants.revoke",
    DatabasesGet => "databases.get",
    DatabasesList => "databases.list",
    DatabasesQuery => "databases.query",
    DatabasesExport => "databases.export",
    InstancesCreate => "instances.create",
    InstancesGet => "instances.get",
    InstancesSync => "instances.sync",
    IssueCommentsCreate => "issueComments.create",
    IssueCommentsList => "issueComments.list",
    IssueCommentsUpdate => "issueComments.update",
    IssuesCreate => "issues.create",
    IssuesGet => "issues.get",
    IssuesList => "issues.list",
    IssuesUpdate => "issues.update",
    PlanCheckRunsGet => "planCheckRuns.get",
    PlanCheckRunsList => "planCheckRuns.list",
    PlanCheckRunsRun => "planCheckRuns.run",
    PlansCreate => "plans.create",
    PlansGet => "plans.get",
    PlansList => "plans.list",
    PlansUpdate => "plans.update",
    ProjectsGet => "projects.get",
    ProjectsGetIamPolicy => "projects.getIamPolicy",
    ProjectsSetIamPolicy => "projects.setIamPolicy",
    RolloutsCreate => "rollouts.create",
    RolloutsGet => "rollouts.get",
    SettingsGet => "settings.get",
    SettingsSet => "settings.set",
    TaskRunsCreate => "taskRuns.create",
    TaskRunsList => "taskRuns.list",
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const ROLE_WORKSPACE_ADMIN: &str = "roles/workspaceAdmin";
pub const ROLE_WORKSPACE_DBA: &str = "roles/workspaceDBA";
pub const ROLE_WORKSPACE_MEMBER: &str = "roles/workspaceMember";
pub const ROLE_PROJECT_OWNER: &str = "roles/projectOwner";
pub const ROLE_PROJECT_DEVELOPER: &str = "roles/projectDeveloper";
pub const ROLE_PROJECT_RELEASER: &str = "roles/projectReleaser";
pub const ROLE_PROJECT_QUERIER: &str = "roles/projectQuerier";
pub const ROLE_PROJECT_EXPORTER: &str = "roles/projectExporter";
pub const ROLE_PROJECT_VIEWER: &str = "roles/projectViewer";

const VIEWER: &[Permission] = &[
    Permission::DatabasesGet,
    Permission::DatabasesList,
    Permission::IssueCommentsList,
    Permission::IssuesGet,
    Permission::IssuesList,
    Permission::PlanCheckRunsGet,
    Permission::PlanCheckRunsList,
    Permission::PlansGet,
    Permission::PlansList,
    Permission::ProjectsGet,
    Permission::ProjectsGetIamPolicy,
    Permission::RolloutsGet,
    Permission::TaskRunsList,
];

const DEVELOPER_EXTRA: &[Permission] = &[
    Permission::AccessGrantsCreate,
    Permission::AccessGrantsGet,
    Permission::AccessGrantsList,
    Permission::IssueCommentsCreate,
    Permission::IssueCommentsUpdate,
    Permission::IssuesCreate,
    Permission::IssuesUpdate,
    Permission::PlanCheckRunsRun,
    Permission::PlansCreate,
    Permission::PlansUpdate,
    Permission::RolloutsCreate,
];

const OWNER_EXTRA: &[Permission] = &[
    Permission::AccessGrantsActivate,
    Permission::AccessGrantsRevoke,
    Permission::DatabasesExport,
    Permission::DatabasesQuery,
    Permission::ProjectsSetIamPolicy,
    Permission::TaskRunsCreate,
];

/// Role id to permission set, predefined roles plus custom ones.
#[derive(Debug, Clone)]
pub struct RoleCatalogue {
    roles: HashMap<String, BTreeSet<Permission>>,
}

impl Default for RoleCatalogue {
    fn default() -> Self {
        Self::predefined()
    }
}

impl RoleCatalogue {
    pub fn predefined() -> Self {
        let set = |groups: &[&[Permission]]| -> BTreeSet<Permission> {
            groups.iter().flat_map(|g| g.iter().copied()).collect()
        };
        let all: BTreeSet<Permission> = Permission::ALL.iter().copied().collect();
        let dba: BTreeSet<Permission> = all
            .iter()
            .copied()
            .filter(|p| !matches!(p, Permission::SettingsSet))
            .collect();

        let mut roles = HashMap::new();
        roles.insert(ROLE_WORKSPACE_ADMIN.to_string(), all);
        roles.insert(ROLE_WORKSPACE_DBA.to_string(), dba);
        roles.insert(
            ROLE_WORKSPACE_MEMBER.to_string(),
            set(&[&[Permission::SettingsGet, Permission::InstancesGet]]),
        );
        roles.insert(
            ROLE_PROJECT_OWNER.to_string(),
            set(&[VIEWER, DEVELOPER_EXTRA, OWNER_EXTRA]),
        );
        roles.insert(
            ROLE_PROJECT_DEVELOPER.to_string(),
            set(&[VIEWER, DEVELOPER_EXTRA]),
        );
        roles.insert(
            ROLE_PROJECT_RELEASER.to_string(),
            set(&[VIEWER, &[Permission::TaskRunsCreate]]),
        );
        roles.insert(
            ROLE_PROJECT_QUERIER.to_string(),
            set(&[&[Permission::DatabasesQuery, Permission::DatabasesGet]]),
        );
        roles.insert(
            ROLE_PROJECT_EXPORTER.to_string(),
            set(&[&[Permission::DatabasesExport, Permission::DatabasesGet]]),
        );
        roles.insert(ROLE_PROJECT_VIEWER.to_string(), set(&[VIEWER]));
        Self { roles }
    }

    /// Predefined roles extended by custom ones. Unknown permission ids in
    /// a custom role are ignored with a warning.
    pub fn with_custom(roles: &[Role]) -> Self {
        let mut catalogue = Self::predefined();
        for role in roles {
            let mut perms = BTreeSet::new();
            for raw in &role.permissions {
                match raw.parse::<Permission>() {
                    Ok(p) => {
                        perms.insert(p);
                    }
                    Err(e) => tracing::warn!("Role {}: {}", role.id, e),
                }
            }
            catalogue.roles.insert(format!("roles/{}", role.id), perms);
        }
        catalogue
    }

    pub fn permissions(&self, role: &str) -> Option<&BTreeSet<Permission>> {
        self.roles.get(role)
    }

    pub fn grants(&self, role: &str, permission: Permission) -> bool {
        self.roles
            .get(role)
            .is_some_and(|perms| perms.contains(&permission))
    }

    pub fn contains(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changeflow_ids::RoleId;

    #[test]
    fn test_permission_ids_round_trip() {
        for p in Permission::ALL {
            assert_eq!(p.as_str().parse::<Permission>().unwrap(), *p);
        }
        assert!("issues.destroy".parse::<Permission>().is_err());
    }

    #[test]
    fn test_predefined_roles() {
        let c = RoleCatalogue::predefined();
        assert!(c.grants(ROLE_WORKSPACE_ADMIN, Permission::SettingsSet));
        assert!(!c.grants(ROLE_WORKSPACE_DBA, Permission::SettingsSet));
        assert!(c.grants(ROLE_PROJECT_DEVELOPER, Permission::IssuesCreate));
        assert!(!c.grants(ROLE_PROJECT_DEVELOPER, Permission::TaskRunsCreate));
        assert!(c.grants(ROLE_PROJECT_RELEASER, Permission::TaskRunsCreate));
        assert!(!c.grants(ROLE_PROJECT_VIEWER, Permission::IssuesCreate));
        assert!(!c.grants("roles/nope", Permission::IssuesGet));
    }

    #[test]
    fn test_custom_roles_extend_catalogue() {
        let c = RoleCatalogue::with_custom(&[Role {
            id: RoleId::parse("reviewer").unwrap(),
            title: "Reviewer".into(),
            permissions: vec!["issues.get".into(), "bogus".into()],
        }]);
        assert!(c.grants("roles/reviewer", Permission::IssuesGet));
        assert_eq!(c.permissions("roles/reviewer").unwrap().len(), 1);
        assert!(c.contains(ROLE_PROJECT_OWNER));
    }
}
