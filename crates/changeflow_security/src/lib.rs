//! Changeflow security module.
//!
//! Provides:
//! - **cel**: the condition expression language (parse, check, evaluate)
//! - **permission**: permission ids and the role catalogue
//! - **policy**: IAM policy evaluation and the self-approval rule

pub mod cel;
pub mod permission;
pub mod policy;

pub use cel::{Activation, CelError, Environment, Expr, Program, Value};
pub use permission::{Permission, RoleCatalogue};
pub use policy::{
    condition_environment, request_activation, self_approval_allowed, PolicyEvaluator, Principal,
};
