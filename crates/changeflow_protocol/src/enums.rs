//! Canonical enums with stable integer tags.
//!
//! Persisted payloads encode every enum as its integer tag. Tags are never
//! reused; a retired variant keeps its number reserved. The upper-case wire
//! name (`as_str`) is what filters, CLI output and comments use.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Error returned when a wire name or integer tag does not name a variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub enum_name: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} {:?}", self.enum_name, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! stable_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $tag:literal => $wire:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn tag(self) -> i32 {
                match self {
                    $($name::$variant => $tag),+
                }
            }

            pub fn from_tag(tag: i32) -> Option<Self> {
                match tag {
                    $($tag => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    _ => Err(UnknownVariant {
                        enum_name: stringify!($name),
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_i32(self.tag())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let tag = i32::deserialize(deserializer)?;
                $name::from_tag(tag).ok_or_else(|| {
                    serde::de::Error::custom(UnknownVariant {
                        enum_name: stringify!($name),
                        value: tag.to_string(),
                    })
                })
            }
        }
    };
}

// ============================================================================
// Issues and approvals
// ============================================================================

stable_enum! {
    /// Issue type. Drives which CreateIssue preconditions apply.
    pub enum IssueType {
        DatabaseChange = 1 => "DATABASE_CHANGE",
        GrantRequest = 2 => "GRANT_REQUEST",
        DatabaseDataExport = 3 => "DATABASE_DATA_EXPORT",
        AccessGrant = 4 => "ACCESS_GRANT",
    }
}

impl IssueType {
    /// Types whose approval template is resolved synchronously at creation.
    pub fn finds_approval_synchronously(self) -> bool {
        matches!(
            self,
            IssueType::AccessGrant | IssueType::GrantRequest | IssueType::DatabaseDataExport
        )
    }

    /// Types that complete themselves once fully approved.
    pub fn is_grant(self) -> bool {
        matches!(self, IssueType::AccessGrant | IssueType::GrantRequest)
    }
}

stable_enum! {
    pub enum IssueStatus {
        Open = 1 => "OPEN",
        Done = 2 => "DONE",
        Canceled = 3 => "CANCELED",
    }
}

impl IssueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, IssueStatus::Done | IssueStatus::Canceled)
    }
}

stable_enum! {
    pub enum ApproverStatus {
        Pending = 1 => "PENDING",
        Approved = 2 => "APPROVED",
        Rejected = 3 => "REJECTED",
    }
}

stable_enum! {
    /// Approval status derived from the approval payload. Never persisted.
    pub enum ApprovalStatus {
        Checking = 1 => "CHECKING",
        Error = 2 => "ERROR",
        Skipped = 3 => "SKIPPED",
        Pending = 4 => "PENDING",
        Approved = 5 => "APPROVED",
        Rejected = 6 => "REJECTED",
    }
}

stable_enum! {
    #[derive(Default)]
    pub enum RiskLevel {
        #[default]
        Unspecified = 0 => "UNSPECIFIED",
        Low = 100 => "LOW",
        Moderate = 200 => "MODERATE",
        High = 300 => "HIGH",
    }
}

stable_enum! {
    #[derive(Default)]
    pub enum RiskSource {
        #[default]
        Unspecified = 0 => "UNSPECIFIED",
        CreateDatabase = 1 => "CREATE_DATABASE",
        Ddl = 2 => "DDL",
        Dml = 3 => "DML",
        DataExport = 4 => "DATA_EXPORT",
        RequestQuery = 5 => "REQUEST_QUERY",
        RequestExport = 6 => "REQUEST_EXPORT",
        RequestAccess = 7 => "REQUEST_ACCESS",
    }
}

// ============================================================================
// Plans and plan checks
// ============================================================================

stable_enum! {
    #[derive(Default)]
    pub enum PlanState {
        #[default]
        Active = 1 => "ACTIVE",
        Deleted = 2 => "DELETED",
    }
}

stable_enum! {
    #[derive(Default)]
    pub enum ChangeType {
        #[default]
        Migrate = 1 => "MIGRATE",
        Sdl = 2 => "SDL",
        Data = 3 => "DATA",
    }
}

stable_enum! {
    #[derive(Default)]
    pub enum ExportFormat {
        #[default]
        Csv = 1 => "CSV",
        Json = 2 => "JSON",
        Sql = 3 => "SQL",
        Xlsx = 4 => "XLSX",
    }
}

stable_enum! {
    pub enum PlanCheckRunStatus {
        Running = 1 => "RUNNING",
        Done = 2 => "DONE",
        Failed = 3 => "FAILED",
        Canceled = 4 => "CANCELED",
    }
}

impl PlanCheckRunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PlanCheckRunStatus::Running)
    }
}

stable_enum! {
    pub enum PlanCheckType {
        StatementAdvise = 1 => "STATEMENT_ADVISE",
        StatementSummaryReport = 2 => "STATEMENT_SUMMARY_REPORT",
        GhostSync = 3 => "GHOST_SYNC",
    }
}

stable_enum! {
    pub enum CheckResultStatus {
        Success = 1 => "SUCCESS",
        Warning = 2 => "WARNING",
        Error = 3 => "ERROR",
    }
}

// ============================================================================
// Rollouts
// ============================================================================

stable_enum! {
    pub enum TaskType {
        DatabaseCreate = 1 => "DATABASE_CREATE",
        DatabaseMigrate = 2 => "DATABASE_MIGRATE",
        DatabaseSdl = 3 => "DATABASE_SDL",
        DatabaseExport = 4 => "DATABASE_EXPORT",
    }
}

stable_enum! {
    pub enum MigrateType {
        Ddl = 1 => "DDL",
        Ghost = 2 => "GHOST",
        Dml = 3 => "DML",
    }
}

stable_enum! {
    #[derive(Default)]
    pub enum TaskRunStatus {
        #[default]
        NotStarted = 1 => "NOT_STARTED",
        Pending = 2 => "PENDING",
        Running = 3 => "RUNNING",
        Done = 4 => "DONE",
        Failed = 5 => "FAILED",
        Canceled = 6 => "CANCELED",
        Skipped = 7 => "SKIPPED",
    }
}

impl TaskRunStatus {
    /// Statuses after which a stage no longer waits on the task.
    pub fn is_stage_terminal(self) -> bool {
        matches!(self, TaskRunStatus::Done | TaskRunStatus::Skipped)
    }

    /// Statuses that block issue status changes and new runs.
    pub fn is_active(self) -> bool {
        matches!(self, TaskRunStatus::Pending | TaskRunStatus::Running)
    }

    /// Whether a run may move from `self` to `next`.
    ///
    /// ```text
    /// PENDING -> RUNNING -> DONE | FAILED | CANCELED
    /// PENDING -> CANCELED
    /// ```
    pub fn can_transition_to(self, next: TaskRunStatus) -> bool {
        use TaskRunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Canceled)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }
}

// ============================================================================
// Access grants
// ============================================================================

stable_enum! {
    pub enum AccessGrantStatus {
        Pending = 1 => "PENDING",
        Active = 2 => "ACTIVE",
        Revoked = 3 => "REVOKED",
    }
}

// ============================================================================
// Catalogue
// ============================================================================

stable_enum! {
    pub enum Engine {
        Mysql = 1 => "MYSQL",
        Postgres = 2 => "POSTGRES",
        Clickhouse = 3 => "CLICKHOUSE",
        Snowflake = 4 => "SNOWFLAKE",
        Sqlite = 5 => "SQLITE",
        Tidb = 6 => "TIDB",
        Mongodb = 7 => "MONGODB",
        Oracle = 8 => "ORACLE",
        Mssql = 9 => "MSSQL",
        Redis = 10 => "REDIS",
    }
}

impl Engine {
    /// Engines the online schema migration tool supports.
    pub fn supports_ghost(self) -> bool {
        matches!(self, Engine::Mysql | Engine::Tidb)
    }
}

stable_enum! {
    pub enum DataSourceType {
        Admin = 1 => "ADMIN",
        ReadOnly = 2 => "READ_ONLY",
    }
}

stable_enum! {
    #[derive(Default)]
    pub enum EnvironmentTier {
        #[default]
        Unprotected = 1 => "UNPROTECTED",
        Protected = 2 => "PROTECTED",
    }
}

stable_enum! {
    #[derive(Default)]
    pub enum SyncState {
        #[default]
        Ok = 1 => "OK",
        NotFound = 2 => "NOT_FOUND",
    }
}

stable_enum! {
    pub enum WebhookEventType {
        IssueCreated = 1 => "ISSUE_CREATED",
        IssueUpdated = 2 => "ISSUE_UPDATED",
        IssueStatusUpdated = 3 => "ISSUE_STATUS_UPDATED",
        IssueCommentCreated = 4 => "ISSUE_COMMENT_CREATED",
        IssueApprovalCreated = 5 => "ISSUE_APPROVAL_CREATED",
        IssueApprovalPassed = 6 => "ISSUE_APPROVAL_PASSED",
        IssueRolloutReady = 7 => "ISSUE_ROLLOUT_READY",
        StageEnded = 8 => "STAGE_ENDED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip_through_json() {
        for status in TaskRunStatus::ALL {
            let json = serde_json::to_string(status).unwrap();
            assert_eq!(json, status.tag().to_string());
            let back: TaskRunStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, *status);
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = serde_json::from_str::<IssueStatus>("42").unwrap_err();
        assert!(err.to_string().contains("unknown IssueStatus"));
    }

    #[test]
    fn test_wire_names_parse() {
        assert_eq!("OPEN".parse::<IssueStatus>().unwrap(), IssueStatus::Open);
        assert_eq!(
            "DATABASE_CHANGE".parse::<IssueType>().unwrap(),
            IssueType::DatabaseChange
        );
        assert!("open".parse::<IssueStatus>().is_err());
    }

    #[test]
    fn test_tags_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for level in RiskLevel::ALL {
            assert!(seen.insert(level.tag()));
        }
    }

    #[test]
    fn test_task_run_lattice() {
        use TaskRunStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Done));
        assert!(!Done.can_transition_to(Running));
        assert!(!NotStarted.can_transition_to(Done));
        assert!(Skipped.is_stage_terminal());
        assert!(!Failed.is_stage_terminal());
    }

    #[test]
    fn test_issue_status_terminal() {
        assert!(IssueStatus::Done.is_terminal());
        assert!(IssueStatus::Canceled.is_terminal());
        assert!(!IssueStatus::Open.is_terminal());
    }
}
