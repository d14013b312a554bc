//! IAM policy evaluation.
//!
//! A principal holds a permission when any active binding of the
//! workspace policy, or of the project policy for project resources,
//! names the principal and a role granting the permission.

use crate::cel::{Activation, CelError, Environment, Result};
use crate::permission::{Permission, RoleCatalogue};
use changeflow_protocol::{Binding, IamPolicy, Member};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::debug;

/// Variables a binding condition may reference.
pub const CONDITION_VARIABLES: &[&str] = &[
    "request.time",
    "request.row_limit",
    "resource.database",
    "resource.schema",
    "resource.table",
    "resource.environment_id",
];

pub fn condition_environment() -> Environment {
    Environment::new(CONDITION_VARIABLES.iter().copied())
}

/// The caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub email: String,
    /// Emails of the groups the principal belongs to.
    pub groups: Vec<String>,
}

impl Principal {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    pub fn matches(&self, member: &str) -> bool {
        match Member::parse(member) {
            Some(Member::AllUsers) => true,
            Some(Member::User(email)) => email == self.email,
            Some(Member::Group(email)) => self.groups.contains(&email),
            None => false,
        }
    }
}

/// Activation carrying `request.time`.
pub fn request_activation(now: DateTime<Utc>) -> Activation {
    let mut act = Activation::new();
    act.insert("request.time", now);
    act
}

pub struct PolicyEvaluator<'a> {
    catalogue: &'a RoleCatalogue,
    env: Environment,
}

impl<'a> PolicyEvaluator<'a> {
    pub fn new(catalogue: &'a RoleCatalogue) -> Self {
        Self {
            catalogue,
            env: condition_environment(),
        }
    }

    /// Whether `binding` applies to `principal` under `attrs`.
    ///
    /// A condition over an attribute the request does not carry leaves the
    /// binding inactive; any other evaluation failure is an error.
    fn is_active(&self, binding: &Binding, principal: &Principal, attrs: &Activation) -> Result<bool> {
        if !binding.members.iter().any(|m| principal.matches(m)) {
            return Ok(false);
        }
        let Some(condition) = binding
            .condition
            .as_ref()
            .filter(|c| !c.expression.trim().is_empty())
        else {
            return Ok(true);
        };
        let program = self.env.compile(&condition.expression)?;
        match program.eval_bool(attrs) {
            Ok(active) => Ok(active),
            Err(CelError::NoSuchKey(key)) | Err(CelError::UndeclaredReference(key)) => {
                debug!("Binding {} inactive: missing attribute {}", binding.role, key);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Roles the principal holds through active bindings.
    pub fn roles(
        &self,
        principal: &Principal,
        workspace: &IamPolicy,
        project: Option<&IamPolicy>,
        attrs: &Activation,
    ) -> Result<BTreeSet<String>> {
        let mut roles = BTreeSet::new();
        for binding in workspace
            .bindings
            .iter()
            .chain(project.into_iter().flat_map(|p| p.bindings.iter()))
        {
            if self.is_active(binding, principal, attrs)? {
                roles.insert(binding.role.clone());
            }
        }
        Ok(roles)
    }

    pub fn check(
        &self,
        principal: &Principal,
        permission: Permission,
        workspace: &IamPolicy,
        project: Option<&IamPolicy>,
        attrs: &Activation,
    ) -> Result<bool> {
        let roles = self.roles(principal, workspace, project, attrs)?;
        Ok(roles.iter().any(|r| self.catalogue.grants(r, permission)))
    }
}

/// Self-approval is allowed only when the project permits it.
pub fn self_approval_allowed(allow_self_approval: bool, creator: &str, approver: &str) -> bool {
    allow_self_approval || creator != approver
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::{ROLE_PROJECT_DEVELOPER, ROLE_PROJECT_QUERIER, ROLE_WORKSPACE_ADMIN};
    use changeflow_protocol::Condition;

    fn binding(role: &str, members: &[&str], condition: Option<&str>) -> Binding {
        Binding {
            role: role.into(),
            members: members.iter().map(|m| m.to_string()).collect(),
            condition: condition.map(|e| Condition {
                expression: e.into(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_member_matching() {
        let p = Principal::new("alice@x").with_groups(vec!["dev@x".into()]);
        assert!(p.matches("user:alice@x"));
        assert!(p.matches("group:dev@x"));
        assert!(p.matches("allUsers"));
        assert!(!p.matches("user:bob@x"));
        assert!(!p.matches("alice@x"));
    }

    #[test]
    fn test_workspace_and_project_bindings() {
        let catalogue = RoleCatalogue::predefined();
        let eval = PolicyEvaluator::new(&catalogue);
        let workspace = IamPolicy {
            bindings: vec![binding(ROLE_WORKSPACE_ADMIN, &["user:root@x"], None)],
        };
        let project = IamPolicy {
            bindings: vec![binding(ROLE_PROJECT_DEVELOPER, &["group:dev@x"], None)],
        };
        let attrs = request_activation(Utc::now());

        let root = Principal::new("root@x");
        assert!(eval
            .check(&root, Permission::SettingsSet, &workspace, None, &attrs)
            .unwrap());

        let dev = Principal::new("alice@x").with_groups(vec!["dev@x".into()]);
        assert!(eval
            .check(&dev, Permission::IssuesCreate, &workspace, Some(&project), &attrs)
            .unwrap());
        assert!(!eval
            .check(&dev, Permission::IssuesCreate, &workspace, None, &attrs)
            .unwrap());
        assert!(!eval
            .check(&dev, Permission::TaskRunsCreate, &workspace, Some(&project), &attrs)
            .unwrap());
    }

    #[test]
    fn test_conditional_binding_expires() {
        let catalogue = RoleCatalogue::predefined();
        let eval = PolicyEvaluator::new(&catalogue);
        let project = IamPolicy {
            bindings: vec![binding(
                ROLE_PROJECT_QUERIER,
                &["user:alice@x"],
                Some("request.time < timestamp('2030-01-01T00:00:00Z')"),
            )],
        };
        let alice = Principal::new("alice@x");
        let before = DateTime::parse_from_rfc3339("2029-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let after = DateTime::parse_from_rfc3339("2031-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let empty = IamPolicy::default();
        assert!(eval
            .check(&alice, Permission::DatabasesQuery, &empty, Some(&project), &request_activation(before))
            .unwrap());
        assert!(!eval
            .check(&alice, Permission::DatabasesQuery, &empty, Some(&project), &request_activation(after))
            .unwrap());
    }

    #[test]
    fn test_condition_on_missing_resource_is_inactive() {
        let catalogue = RoleCatalogue::predefined();
        let eval = PolicyEvaluator::new(&catalogue);
        let project = IamPolicy {
            bindings: vec![binding(
                ROLE_PROJECT_QUERIER,
                &["user:alice@x"],
                Some("resource.database == 'instances/i1/databases/d1'"),
            )],
        };
        let alice = Principal::new("alice@x");
        let attrs = request_activation(Utc::now());
        let roles = eval
            .roles(&alice, &IamPolicy::default(), Some(&project), &attrs)
            .unwrap();
        assert!(roles.is_empty());

        let mut with_db = attrs.clone();
        with_db.insert("resource.database", "instances/i1/databases/d1");
        let roles = eval
            .roles(&alice, &IamPolicy::default(), Some(&project), &with_db)
            .unwrap();
        assert!(roles.contains(ROLE_PROJECT_QUERIER));
    }

    #[test]
    fn test_self_approval() {
        assert!(!self_approval_allowed(false, "bob@x", "bob@x"));
        assert!(self_approval_allowed(false, "bob@x", "alice@x"));
        assert!(self_approval_allowed(true, "bob@x", "bob@x"));
    }
}
