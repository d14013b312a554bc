//! Domain model shared by every changeflow crate.
//!
//! One internal model serves both the API boundary and the storage boundary.
//! Enums carry stable integer tags (see [`enums`]); payload structs default
//! missing fields so older rows keep deserializing.
//!
//! ```text
//! Project ── Plan ── Spec*            Issue ── ApprovalPayload
//!    │         │                        │  └── GrantRequest?
//!    │         └── PlanCheckRun*        └── Comment*
//!    │         └── Pipeline ── Task* ── TaskRun*
//!    └── AccessGrant ── (companion Issue)
//! ```

pub mod catalog;
pub mod comment;
pub mod config;
pub mod defaults;
pub mod enums;
pub mod error;
pub mod grant;
pub mod iam;
pub mod issue;
pub mod page;
pub mod plan;
pub mod rollout;
pub mod setting;

pub use catalog::*;
pub use comment::*;
pub use config::{ConfigError, PlanTier, SystemConfig};
pub use enums::*;
pub use error::{ApiError, ApiResult, Code, ErrorContext};
pub use grant::*;
pub use iam::*;
pub use issue::*;
pub use page::Pagination;
pub use plan::*;
pub use rollout::*;
pub use setting::*;
