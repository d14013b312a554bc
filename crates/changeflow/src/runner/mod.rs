//! Background runners owned by the server process.
//!
//! - [`ApprovalRunner`]: drains the approval-check channel and resolves the
//!   approval template of each issue.
//! - [`SlowQueryRunner`]: drains slow-query sync requests.
//!
//! Plan checks and replica signals run inside `changeflow_sentinel`.

mod approval;
mod slow_query;

pub use approval::ApprovalRunner;
pub use slow_query::SlowQueryRunner;
