//! Plan-check executors.
//!
//! Each executor handles one [`PlanCheckType`] for one target database.
//! The built-in set covers a small advice rule set, a statement summary
//! and the gh-ost compatibility check; an external analysis engine plugs
//! in by registering its own [`PlanCheckExecutor`].

use crate::cancel::CancellationToken;
use crate::error::{Result, SchedulerError};
use crate::statement::{split_statements, Statement, StatementKind};
use changeflow_protocol::defaults::MAX_ADVICE_PER_TARGET;
use changeflow_protocol::{ChangeType, CheckResultStatus, Engine, PlanCheckResult, PlanCheckType};
use std::collections::{BTreeMap, HashMap};

/// Statements larger than this skip advice with a warning.
pub const MAX_ADVISE_STATEMENT_BYTES: usize = 2 * 1024 * 1024;

// Result codes surfaced in `PlanCheckResult::code`.
pub const CODE_OK: i32 = 0;
pub const CODE_SIZE_EXCEEDED: i32 = 5;
pub const CODE_STATEMENT_NO_WHERE: i32 = 202;
pub const CODE_STATEMENT_DROP_TABLE: i32 = 203;
pub const CODE_GHOST_ENGINE: i32 = 301;
pub const CODE_GHOST_STATEMENT: i32 = 302;
pub const CODE_GHOST_FLAG: i32 = 303;

/// gh-ost flags a plan may override.
pub const GHOST_FLAGS: &[&str] = &[
    "allow-on-master",
    "assume-rbr",
    "chunk-size",
    "critical-load",
    "cut-over-lock-timeout-seconds",
    "default-retries",
    "dml-batch-size",
    "exponential-backoff-max-interval",
    "heartbeat-interval-millis",
    "max-lag-millis",
    "max-load",
    "nice-ratio",
    "switch-to-rbr",
];

/// Inputs of one check over one target.
#[derive(Debug, Clone)]
pub struct CheckContext<'a> {
    /// `instances/{iid}/databases/{db}`.
    pub database: &'a str,
    pub engine: Engine,
    pub sql: &'a str,
    pub change_type: ChangeType,
    pub enable_prior_backup: bool,
    pub ghost_flags: &'a BTreeMap<String, String>,
}

pub trait PlanCheckExecutor: Send + Sync {
    fn check_type(&self) -> PlanCheckType;

    /// Runs the check. Implementations poll `token` between units of work
    /// and return [`SchedulerError::Canceled`] once it fires.
    fn run(&self, ctx: &CheckContext<'_>, token: &CancellationToken) -> Result<Vec<PlanCheckResult>>;
}

fn result(
    ctx: &CheckContext<'_>,
    check_type: PlanCheckType,
    status: CheckResultStatus,
    code: i32,
    title: impl Into<String>,
    content: impl Into<String>,
) -> PlanCheckResult {
    PlanCheckResult {
        target: ctx.database.to_string(),
        check_type,
        status,
        title: title.into(),
        content: content.into(),
        code,
    }
}

fn checkpoint(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(SchedulerError::Canceled);
    }
    Ok(())
}

// ============================================================================
// Statement advise
// ============================================================================

#[derive(Debug, Default)]
pub struct StatementAdviseExecutor;

impl StatementAdviseExecutor {
    fn supports(engine: Engine) -> bool {
        matches!(
            engine,
            Engine::Mysql
                | Engine::Tidb
                | Engine::Postgres
                | Engine::Oracle
                | Engine::Mssql
                | Engine::Snowflake
        )
    }

    fn advise(ctx: &CheckContext<'_>, stmt: &Statement) -> Option<PlanCheckResult> {
        let check = PlanCheckType::StatementAdvise;
        match stmt.kind {
            StatementKind::Update | StatementKind::Delete if !stmt.has_where => Some(result(
                ctx,
                check,
                CheckResultStatus::Warning,
                CODE_STATEMENT_NO_WHERE,
                "statement.where.require",
                format!("{} at line {} has no WHERE clause", stmt.kind, stmt.line),
            )),
            StatementKind::DropTable => Some(result(
                ctx,
                check,
                CheckResultStatus::Error,
                CODE_STATEMENT_DROP_TABLE,
                "statement.disallow-drop-table",
                format!("dropping tables is not allowed, found at line {}", stmt.line),
            )),
            _ => None,
        }
    }
}

impl PlanCheckExecutor for StatementAdviseExecutor {
    fn check_type(&self) -> PlanCheckType {
        PlanCheckType::StatementAdvise
    }

    fn run(&self, ctx: &CheckContext<'_>, token: &CancellationToken) -> Result<Vec<PlanCheckResult>> {
        let check = self.check_type();
        if !Self::supports(ctx.engine) {
            return Ok(vec![result(
                ctx,
                check,
                CheckResultStatus::Success,
                CODE_OK,
                format!("Statement advise is not supported for {}", ctx.engine),
                "",
            )]);
        }
        if ctx.sql.len() > MAX_ADVISE_STATEMENT_BYTES {
            return Ok(vec![result(
                ctx,
                check,
                CheckResultStatus::Warning,
                CODE_SIZE_EXCEEDED,
                "Large SQL review policy is disabled",
                format!(
                    "statement is {} bytes, advice runs up to {} bytes",
                    ctx.sql.len(),
                    MAX_ADVISE_STATEMENT_BYTES
                ),
            )]);
        }

        let mut advice = Vec::new();
        for stmt in split_statements(ctx.sql) {
            checkpoint(token)?;
            if let Some(found) = Self::advise(ctx, &stmt) {
                advice.push(found);
                if advice.len() >= MAX_ADVICE_PER_TARGET {
                    break;
                }
            }
        }
        if advice.is_empty() {
            advice.push(result(ctx, check, CheckResultStatus::Success, CODE_OK, "OK", ""));
        }
        Ok(advice)
    }
}

// ============================================================================
// Statement summary report
// ============================================================================

#[derive(Debug, Default)]
pub struct StatementSummaryReportExecutor;

impl PlanCheckExecutor for StatementSummaryReportExecutor {
    fn check_type(&self) -> PlanCheckType {
        PlanCheckType::StatementSummaryReport
    }

    fn run(&self, ctx: &CheckContext<'_>, token: &CancellationToken) -> Result<Vec<PlanCheckResult>> {
        let statements = split_statements(ctx.sql);
        let mut counts: BTreeMap<StatementKind, usize> = BTreeMap::new();
        for stmt in &statements {
            checkpoint(token)?;
            *counts.entry(stmt.kind).or_default() += 1;
        }
        let breakdown = counts
            .iter()
            .map(|(kind, n)| format!("{} x{}", kind, n))
            .collect::<Vec<_>>()
            .join(", ");
        let ddl = statements.iter().filter(|s| s.kind.is_ddl()).count();
        let dml = statements.iter().filter(|s| s.kind.is_dml()).count();

        let mut out = vec![result(
            ctx,
            self.check_type(),
            CheckResultStatus::Success,
            CODE_OK,
            format!("{} statement(s)", statements.len()),
            breakdown,
        )];
        if ctx.change_type == ChangeType::Data && ddl > 0 {
            out.push(result(
                ctx,
                self.check_type(),
                CheckResultStatus::Warning,
                CODE_OK,
                "Schema change in a data change",
                format!("{} DDL statement(s) in a DATA change", ddl),
            ));
        }
        if ctx.enable_prior_backup && dml == 0 {
            out.push(result(
                ctx,
                self.check_type(),
                CheckResultStatus::Warning,
                CODE_OK,
                "Prior backup has nothing to back up",
                "prior backup is enabled but no UPDATE or DELETE was found",
            ));
        }
        Ok(out)
    }
}

// ============================================================================
// gh-ost sync
// ============================================================================

#[derive(Debug, Default)]
pub struct GhostSyncExecutor;

impl PlanCheckExecutor for GhostSyncExecutor {
    fn check_type(&self) -> PlanCheckType {
        PlanCheckType::GhostSync
    }

    fn run(&self, ctx: &CheckContext<'_>, token: &CancellationToken) -> Result<Vec<PlanCheckResult>> {
        let check = self.check_type();
        if !ctx.engine.supports_ghost() {
            return Ok(vec![result(
                ctx,
                check,
                CheckResultStatus::Error,
                CODE_GHOST_ENGINE,
                "gh-ost is not supported",
                format!("gh-ost only supports MySQL and TiDB, found {}", ctx.engine),
            )]);
        }

        let mut out = Vec::new();
        for flag in ctx.ghost_flags.keys() {
            if !GHOST_FLAGS.contains(&flag.as_str()) {
                out.push(result(
                    ctx,
                    check,
                    CheckResultStatus::Error,
                    CODE_GHOST_FLAG,
                    "Invalid gh-ost flag",
                    format!("unsupported flag {:?}", flag),
                ));
            }
        }
        for stmt in split_statements(ctx.sql) {
            checkpoint(token)?;
            if stmt.kind != StatementKind::AlterTable {
                out.push(result(
                    ctx,
                    check,
                    CheckResultStatus::Error,
                    CODE_GHOST_STATEMENT,
                    "gh-ost only runs ALTER TABLE",
                    format!("{} at line {}", stmt.kind, stmt.line),
                ));
            }
        }
        if out.is_empty() {
            out.push(result(ctx, check, CheckResultStatus::Success, CODE_OK, "OK", ""));
        }
        Ok(out)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Executors by check type.
pub struct ExecutorRegistry {
    executors: HashMap<PlanCheckType, Box<dyn PlanCheckExecutor>>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ExecutorRegistry {
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(StatementAdviseExecutor));
        registry.register(Box::new(StatementSummaryReportExecutor));
        registry.register(Box::new(GhostSyncExecutor));
        registry
    }

    /// Registers an executor, replacing any previous one for its type.
    pub fn register(&mut self, executor: Box<dyn PlanCheckExecutor>) {
        self.executors.insert(executor.check_type(), executor);
    }

    pub fn get(&self, check_type: PlanCheckType) -> Option<&dyn PlanCheckExecutor> {
        self.executors.get(&check_type).map(|e| e.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(sql: &'a str, engine: Engine, flags: &'a BTreeMap<String, String>) -> CheckContext<'a> {
        CheckContext {
            database: "instances/i1/databases/d1",
            engine,
            sql,
            change_type: ChangeType::Migrate,
            enable_prior_backup: false,
            ghost_flags: flags,
        }
    }

    #[test]
    fn test_advise_flags_missing_where_and_drop_table() {
        let flags = BTreeMap::new();
        let sql = "UPDATE t SET a = 1; DELETE FROM t WHERE id = 1; DROP TABLE t";
        let out = StatementAdviseExecutor
            .run(&ctx(sql, Engine::Mysql, &flags), &CancellationToken::new())
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].code, CODE_STATEMENT_NO_WHERE);
        assert_eq!(out[0].status, CheckResultStatus::Warning);
        assert_eq!(out[1].code, CODE_STATEMENT_DROP_TABLE);
        assert_eq!(out[1].status, CheckResultStatus::Error);
        assert_eq!(out[1].target, "instances/i1/databases/d1");
    }

    #[test]
    fn test_advise_clean_and_unsupported_engine() {
        let flags = BTreeMap::new();
        let token = CancellationToken::new();
        let out = StatementAdviseExecutor
            .run(&ctx("SELECT 1", Engine::Postgres, &flags), &token)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title, "OK");

        let out = StatementAdviseExecutor
            .run(&ctx("DROP TABLE t", Engine::Redis, &flags), &token)
            .unwrap();
        assert_eq!(out[0].status, CheckResultStatus::Success);
        assert!(out[0].title.contains("not supported"));
    }

    #[test]
    fn test_canceled_token_stops_executor() {
        let flags = BTreeMap::new();
        let token = CancellationToken::new();
        token.cancel();
        let err = StatementAdviseExecutor
            .run(&ctx("SELECT 1", Engine::Mysql, &flags), &token)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Canceled));
    }

    #[test]
    fn test_summary_report_counts_kinds() {
        let flags = BTreeMap::new();
        let sql = "INSERT INTO t VALUES (1); INSERT INTO t VALUES (2); ALTER TABLE t ADD b INT";
        let out = StatementSummaryReportExecutor
            .run(&ctx(sql, Engine::Mysql, &flags), &CancellationToken::new())
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title, "3 statement(s)");
        assert_eq!(out[0].content, "INSERT x2, ALTER_TABLE x1");
    }

    #[test]
    fn test_ghost_requires_mysql_family_and_alter() {
        let mut flags = BTreeMap::new();
        let token = CancellationToken::new();
        let out = GhostSyncExecutor
            .run(&ctx("ALTER TABLE t ADD b INT", Engine::Postgres, &flags), &token)
            .unwrap();
        assert_eq!(out[0].code, CODE_GHOST_ENGINE);

        let out = GhostSyncExecutor
            .run(&ctx("ALTER TABLE t ADD b INT", Engine::Tidb, &flags), &token)
            .unwrap();
        assert_eq!(out[0].status, CheckResultStatus::Success);

        flags.insert("bogus".to_string(), "1".to_string());
        let out = GhostSyncExecutor
            .run(&ctx("ALTER TABLE t ADD b INT; UPDATE t SET b = 1", Engine::Mysql, &flags), &token)
            .unwrap();
        let codes: Vec<i32> = out.iter().map(|r| r.code).collect();
        assert_eq!(codes, vec![CODE_GHOST_FLAG, CODE_GHOST_STATEMENT]);
    }

    #[test]
    fn test_registry_builtin() {
        let registry = ExecutorRegistry::builtin();
        for check in PlanCheckType::ALL {
            assert_eq!(registry.get(*check).unwrap().check_type(), *check);
        }
        assert!(ExecutorRegistry::empty().get(PlanCheckType::GhostSync).is_none());
    }
}
