//! Changeflow - issue, approval, plan and rollout orchestration.
//!
//! The services in [`service`] are the API surface. They share one
//! [`service::AppState`], built by [`server`], which also owns the
//! background runners.

pub mod approval;
pub mod comment;
pub mod context;
pub mod dbgroup;
pub mod filter;
pub mod iam;
pub mod license;
pub mod plan_check;
pub mod plan_validator;
pub mod rollout;
pub mod runner;
pub mod server;
pub mod service;
pub mod webhook;

pub use context::RequestContext;
pub use server::{open_state, Server, ServerError};
pub use service::AppState;
