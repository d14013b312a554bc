//! Shared identifier wrappers and resource names for changeflow.
//!
//! Every public entity is addressed by a hierarchical resource name of the
//! shape `segment0/id0/segment1/id1/...`. This crate is the single source of
//! syntactic truth for those names: callers format names through the types in
//! [`names`] and never concatenate strings themselves.
//!
//! ```text
//! projects/p1/issues/7
//! ^^^^^^^^ ^^ ^^^^^^ ^
//! keyword  id keyword uid
//! ```

pub mod names;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

pub use names::*;

/// Error returned when parsing an identifier or a resource name fails.
///
/// Callers at the API boundary surface this as `InvalidArgument`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdParseError {}

/// Lower-kebab resource id: `^[a-z]([a-z0-9-]{0,61}[a-z0-9])?$`.
static RESOURCE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z]([a-z0-9-]{0,61}[a-z0-9])?$").expect("resource id pattern is valid")
});

/// Role ids also admit the upper-case and camel-case built-ins
/// (`projectOwner`, `CREATOR`, `LAST_APPROVER`).
static ROLE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,63}$").expect("role id pattern is valid")
});

/// Wildcard id accepted only as the parent of list operations.
pub const WILDCARD: &str = "-";

/// Returns true if `value` is a valid lower-kebab resource id.
pub fn is_valid_resource_id(value: &str) -> bool {
    RESOURCE_ID.is_match(value)
}

macro_rules! define_resource_id {
    ($name:ident, $label:expr, $pattern:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                if value.is_empty() {
                    return Err(IdParseError::new(format!("{} cannot be empty", $label)));
                }
                if !$pattern.is_match(value) {
                    return Err(IdParseError::new(format!(
                        "invalid {} {:?}, must match {}",
                        $label,
                        value,
                        $pattern.as_str()
                    )));
                }
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdParseError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

define_resource_id!(ProjectId, "project id", RESOURCE_ID);
define_resource_id!(InstanceId, "instance id", RESOURCE_ID);
define_resource_id!(EnvironmentId, "environment id", RESOURCE_ID);
define_resource_id!(DatabaseGroupId, "database group id", RESOURCE_ID);
define_resource_id!(IdpId, "identity provider id", RESOURCE_ID);
define_resource_id!(RoleId, "role id", ROLE_ID);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_accepts_kebab_case() {
        assert!(ProjectId::parse("p1").is_ok());
        assert!(ProjectId::parse("my-project-2").is_ok());
        assert!(ProjectId::parse("a").is_ok());
    }

    #[test]
    fn test_resource_id_rejects_bad_shapes() {
        assert!(ProjectId::parse("").is_err());
        assert!(ProjectId::parse("1abc").is_err());
        assert!(ProjectId::parse("abc-").is_err());
        assert!(ProjectId::parse("Abc").is_err());
        assert!(ProjectId::parse("a_b").is_err());
        assert!(ProjectId::parse(&"a".repeat(64)).is_err());
        assert!(ProjectId::parse(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_role_id_accepts_builtin_shapes() {
        assert!(RoleId::parse("projectOwner").is_ok());
        assert!(RoleId::parse("LAST_APPROVER").is_ok());
        assert!(RoleId::parse("reviewer").is_ok());
        assert!(RoleId::parse("9lives").is_err());
    }

    #[test]
    fn test_resource_id_serde_validates() {
        let ok: ProjectId = serde_json::from_str("\"p1\"").unwrap();
        assert_eq!(ok.as_str(), "p1");
        assert!(serde_json::from_str::<ProjectId>("\"P1\"").is_err());
        assert_eq!(serde_json::to_string(&ok).unwrap(), "\"p1\"");
    }
}
