//! IAM policies: role bindings with optional conditions.

use changeflow_ids::{ALL_USERS_MEMBER, GROUP_MEMBER_PREFIX, USER_MEMBER_PREFIX};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IamPolicy {
    pub bindings: Vec<Binding>,
}

impl IamPolicy {
    /// Adds `member` to a binding for `role` with the same condition,
    /// creating the binding when none exists.
    pub fn add_member(&mut self, role: &str, member: &Member, condition: Option<Condition>) {
        let member = member.to_string();
        if let Some(binding) = self
            .bindings
            .iter_mut()
            .find(|b| b.role == role && b.condition == condition)
        {
            if !binding.members.contains(&member) {
                binding.members.push(member);
            }
            return;
        }
        self.bindings.push(Binding {
            role: role.to_string(),
            members: vec![member],
            condition,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    /// `roles/{rid}`.
    pub role: String,
    pub members: Vec<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Condition {
    pub expression: String,
    pub title: String,
    pub description: String,
}

/// A binding member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Member {
    User(String),
    Group(String),
    AllUsers,
}

impl Member {
    pub fn parse(value: &str) -> Option<Self> {
        if value == ALL_USERS_MEMBER {
            return Some(Member::AllUsers);
        }
        if let Some(email) = value.strip_prefix(USER_MEMBER_PREFIX) {
            return (!email.is_empty()).then(|| Member::User(email.to_string()));
        }
        if let Some(email) = value.strip_prefix(GROUP_MEMBER_PREFIX) {
            return (!email.is_empty()).then(|| Member::Group(email.to_string()));
        }
        None
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::User(email) => write!(f, "{}{}", USER_MEMBER_PREFIX, email),
            Member::Group(email) => write!(f, "{}{}", GROUP_MEMBER_PREFIX, email),
            Member::AllUsers => write!(f, "{}", ALL_USERS_MEMBER),
        }
    }
}
