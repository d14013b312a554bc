//! Sentinel - background coordination for changeflow.
//!
//! The [`Scheduler`] is owned by the process root and handed to services
//! and runners. It carries:
//! - three best-effort channels (approval check, plan-check tickle,
//!   slow-query sync)
//! - the registry of running plan-check runs and their cancel tokens
//!
//! [`PlanCheckRunner`] drains `RUNNING` plan-check runs through the
//! registered [`PlanCheckExecutor`]s, and [`SignalBus`] carries cancel
//! requests between replicas through the store.

pub mod cancel;
pub mod error;
pub mod executor;
pub mod runner;
pub mod scheduler;
pub mod signal;
pub mod statement;

pub use cancel::CancellationToken;
pub use error::{Result, SchedulerError};
pub use executor::{
    CheckContext, ExecutorRegistry, GhostSyncExecutor, PlanCheckExecutor,
    StatementAdviseExecutor, StatementSummaryReportExecutor,
};
pub use runner::PlanCheckRunner;
pub use scheduler::{PlanCheckClaim, Scheduler, SchedulerReceivers};
pub use signal::{Signal, SignalBus, SignalListener};
pub use statement::{split_statements, Statement, StatementKind};
