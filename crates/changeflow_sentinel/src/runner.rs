//! Plan-check runner.
//!
//! Picks up `RUNNING` runs from the store, registers a cancel token for
//! each, executes their targets through the executor registry and writes
//! the outcome. A run canceled meanwhile keeps its `CANCELED` status: the
//! final write only applies to runs still `RUNNING`.

use crate::cancel::CancellationToken;
use crate::error::{Result, SchedulerError};
use crate::executor::{CheckContext, ExecutorRegistry};
use crate::scheduler::Scheduler;
use changeflow_db::Store;
use changeflow_ids::DatabaseName;
use changeflow_protocol::defaults::DEFAULT_MAX_CONCURRENT_PLAN_CHECKS;
use changeflow_protocol::{PlanCheckRun, PlanCheckRunResult, PlanCheckRunStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct PlanCheckRunner {
    store: Store,
    scheduler: Arc<Scheduler>,
    executors: Arc<ExecutorRegistry>,
    max_concurrent: usize,
}

impl PlanCheckRunner {
    pub fn new(store: Store, scheduler: Arc<Scheduler>, executors: Arc<ExecutorRegistry>) -> Self {
        Self {
            store,
            scheduler,
            executors,
            max_concurrent: DEFAULT_MAX_CONCURRENT_PLAN_CHECKS,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Runs every `RUNNING` run not already executing in this process and
    /// waits for them. Returns the number of runs executed.
    pub async fn run_once(&self) -> Result<usize> {
        let runs = self.store.list_running_plan_check_runs().await?;
        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut set = JoinSet::new();

        for run in runs {
            let Some(claim) = self.scheduler.claim_plan_check(run.uid) else {
                continue;
            };
            let runner = self.clone();
            let permits = Arc::clone(&permits);
            set.spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                runner.execute_and_finish(&run, claim.token()).await;
            });
        }

        let mut executed = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(()) => executed += 1,
                Err(e) => error!("Plan check task panicked: {}", e),
            }
        }
        Ok(executed)
    }

    async fn execute_and_finish(&self, run: &PlanCheckRun, token: &CancellationToken) {
        let (status, result) = match self.execute(run, token).await {
            Ok(result) => (PlanCheckRunStatus::Done, result),
            Err(SchedulerError::Canceled) => (
                PlanCheckRunStatus::Canceled,
                PlanCheckRunResult {
                    results: Vec::new(),
                    error: Some("canceled".to_string()),
                },
            ),
            Err(e) => {
                warn!(run = run.uid, "Plan check failed: {}", e);
                (
                    PlanCheckRunStatus::Failed,
                    PlanCheckRunResult {
                        results: Vec::new(),
                        error: Some(e.to_string()),
                    },
                )
            }
        };
        match self.store.finish_plan_check_run(run.uid, status, &result).await {
            Ok(true) => info!(run = run.uid, status = %status, "Plan check finished"),
            Ok(false) => debug!(run = run.uid, "Plan check left RUNNING before it finished"),
            Err(e) => error!(run = run.uid, "Failed to record plan check result: {}", e),
        }
    }

    /// Executes every target of `run`.
    pub async fn execute(
        &self,
        run: &PlanCheckRun,
        token: &CancellationToken,
    ) -> Result<PlanCheckRunResult> {
        let mut results = Vec::new();
        for target in &run.config.targets {
            if token.is_cancelled() {
                return Err(SchedulerError::Canceled);
            }
            let name = DatabaseName::parse(&target.database)
                .map_err(|e| SchedulerError::check(format!("bad target: {}", e)))?;
            let database = self
                .store
                .get_database(&name)
                .await?
                .ok_or_else(|| SchedulerError::check(format!("database {} not found", name)))?;
            let sheet = self
                .store
                .get_sheet(&run.project, &target.sheet_sha256)
                .await?
                .ok_or_else(|| {
                    SchedulerError::check(format!("sheet {} not found", target.sheet_sha256))
                })?;

            let ctx = CheckContext {
                database: &target.database,
                engine: database.engine,
                sql: &sheet.content,
                change_type: target.change_type,
                enable_prior_backup: target.enable_prior_backup,
                ghost_flags: &target.ghost_flags,
            };
            for check_type in &target.types {
                let executor = self.executors.get(*check_type).ok_or_else(|| {
                    SchedulerError::check(format!("no executor for {}", check_type))
                })?;
                results.extend(executor.run(&ctx, token)?);
            }
        }
        Ok(PlanCheckRunResult {
            results,
            error: None,
        })
    }

    /// Scheduler loop: drains on every tickle and on every `interval`.
    pub async fn run(
        self,
        mut tickle: mpsc::Receiver<()>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        info!("Plan check runner started");
        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(0) => {}
                Ok(n) => debug!("Executed {} plan check run(s)", n),
                Err(e) => error!("Plan check scan failed: {}", e),
            }
            tokio::select! {
                received = tickle.recv() => {
                    if received.is_none() {
                        // Producers gone; fall back to the interval alone.
                        tokio::time::sleep(interval).await;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Plan check runner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::PlanCheckExecutor;
    use changeflow_db::NewPlanCheckRun;
    use changeflow_ids::{InstanceId, ProjectId};
    use changeflow_protocol::{
        CheckResultStatus, DataSource, DataSourceType, Database, Engine, Instance, PlanCheckResult,
        PlanCheckRunConfig, PlanCheckTarget, PlanCheckType, SyncState,
    };
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn seeded() -> (Store, TempDir, String) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("checks.db")).await.unwrap();
        store
            .create_instance(&Instance {
                id: InstanceId::parse("i1").unwrap(),
                title: "i1".into(),
                engine: Engine::Mysql,
                environment: None,
                data_sources: vec![DataSource {
                    id: "admin".into(),
                    source_type: DataSourceType::Admin,
                    host: "localhost".into(),
                    port: "3306".into(),
                    username: "root".into(),
                    password: "pw".into(),
                    external_secret: None,
                }],
                activation: true,
                sync_interval_secs: None,
                last_slow_query_sync: None,
                deleted: false,
            })
            .await
            .unwrap();
        store
            .upsert_database(&Database {
                instance: InstanceId::parse("i1").unwrap(),
                name: "d1".into(),
                project: ProjectId::parse("p1").unwrap(),
                environment: None,
                labels: BTreeMap::new(),
                sync_state: SyncState::Ok,
                last_sync_time: None,
            })
            .await
            .unwrap();
        let sheet = store
            .create_sheet(
                &ProjectId::parse("p1").unwrap(),
                "change",
                "UPDATE t SET a = 1",
                "bob@x",
            )
            .await
            .unwrap();
        (store, dir, sheet.sha256)
    }

    fn new_run(sha: &str) -> NewPlanCheckRun {
        NewPlanCheckRun {
            project: ProjectId::parse("p1").unwrap(),
            plan_uid: 1,
            config: PlanCheckRunConfig {
                targets: vec![PlanCheckTarget {
                    database: "instances/i1/databases/d1".into(),
                    sheet_sha256: sha.into(),
                    types: vec![PlanCheckType::StatementAdvise, PlanCheckType::StatementSummaryReport],
                    change_type: Default::default(),
                    enable_prior_backup: false,
                    ghost_flags: BTreeMap::new(),
                }],
            },
        }
    }

    fn runner(store: &Store, scheduler: &Arc<Scheduler>) -> PlanCheckRunner {
        PlanCheckRunner::new(
            store.clone(),
            Arc::clone(scheduler),
            Arc::new(ExecutorRegistry::builtin()),
        )
        .with_max_concurrent(2)
    }

    #[tokio::test]
    async fn test_run_once_executes_and_records_results() {
        let (store, _dir, sha) = seeded().await;
        let scheduler = Arc::new(Scheduler::new(4));
        let runs = store.create_plan_check_runs(&[new_run(&sha)]).await.unwrap();

        assert_eq!(runner(&store, &scheduler).run_once().await.unwrap(), 1);
        let done = store.get_plan_check_run(runs[0].uid).await.unwrap().unwrap();
        assert_eq!(done.status, PlanCheckRunStatus::Done);
        assert_eq!(done.result.results.len(), 2);
        assert_eq!(done.result.results[0].status, CheckResultStatus::Warning);
        assert!(scheduler.running_plan_checks().is_empty());

        // Nothing left to do.
        assert_eq!(runner(&store, &scheduler).run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_sheet_fails_run() {
        let (store, _dir, _sha) = seeded().await;
        let scheduler = Arc::new(Scheduler::new(4));
        let runs = store.create_plan_check_runs(&[new_run("deadbeef")]).await.unwrap();

        runner(&store, &scheduler).run_once().await.unwrap();
        let failed = store.get_plan_check_run(runs[0].uid).await.unwrap().unwrap();
        assert_eq!(failed.status, PlanCheckRunStatus::Failed);
        assert!(failed.result.error.unwrap().contains("deadbeef"));
    }

    #[tokio::test]
    async fn test_registered_runs_are_skipped_and_cancel_is_honoured() {
        let (store, _dir, sha) = seeded().await;
        let scheduler = Arc::new(Scheduler::new(4));
        let runs = store.create_plan_check_runs(&[new_run(&sha)]).await.unwrap();

        let token = scheduler.register_plan_check(runs[0].uid).unwrap();
        assert_eq!(runner(&store, &scheduler).run_once().await.unwrap(), 0);

        token.cancel();
        let err = runner(&store, &scheduler)
            .execute(&runs[0], &token)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Canceled));
        let still = store.get_plan_check_run(runs[0].uid).await.unwrap().unwrap();
        assert_eq!(still.status, PlanCheckRunStatus::Running);
    }

    struct PanickingAdvise(Arc<AtomicUsize>);

    impl PlanCheckExecutor for PanickingAdvise {
        fn check_type(&self) -> PlanCheckType {
            PlanCheckType::StatementAdvise
        }

        fn run(&self, _: &CheckContext<'_>, _: &CancellationToken) -> Result<Vec<PlanCheckResult>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            panic!("advisor crashed");
        }
    }

    #[tokio::test]
    async fn test_panicking_executor_releases_its_run() {
        let (store, _dir, sha) = seeded().await;
        let scheduler = Arc::new(Scheduler::new(4));
        let runs = store.create_plan_check_runs(&[new_run(&sha)]).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut executors = ExecutorRegistry::builtin();
        executors.register(Box::new(PanickingAdvise(Arc::clone(&calls))));
        let runner = PlanCheckRunner::new(store.clone(), Arc::clone(&scheduler), Arc::new(executors));

        assert_eq!(runner.run_once().await.unwrap(), 0);
        assert!(!scheduler.is_plan_check_running(runs[0].uid));

        // The run is still RUNNING and gets picked up again.
        assert_eq!(runner.run_once().await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let run = store.get_plan_check_run(runs[0].uid).await.unwrap().unwrap();
        assert_eq!(run.status, PlanCheckRunStatus::Running);
    }
}
