//! Process root: opens the store, builds the shared state and owns the
//! background tasks.

use crate::runner::{ApprovalRunner, SlowQueryRunner};
use crate::service::AppState;
use crate::webhook::{run_delivery, LogSink, WebhookSink};
use changeflow_db::{DbError, Store};
use changeflow_protocol::SystemConfig;
use changeflow_sentinel::{
    CancellationToken, ExecutorRegistry, PlanCheckRunner, SchedulerError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to open store {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: DbError,
    },

    #[error("Failed to start signal listener: {0}")]
    Signals(#[from] SchedulerError),

    #[error("Background receivers were already taken")]
    AlreadyStarted,
}

/// `database_path` of `config`, relative paths resolved against `home`.
pub fn database_path(config: &SystemConfig, home: &Path) -> PathBuf {
    if config.database_path.is_absolute() {
        config.database_path.clone()
    } else {
        home.join(&config.database_path)
    }
}

/// Opens the store behind `config` and builds the shared state.
pub async fn open_state(config: SystemConfig, home: &Path) -> Result<Arc<AppState>, ServerError> {
    let path = database_path(&config, home);
    let store = Store::open(&path).await.map_err(|source| ServerError::Store {
        path: path.display().to_string(),
        source,
    })?;
    info!(path = %path.display(), "Store opened");
    Ok(AppState::new(store, config))
}

/// A running set of background tasks over one [`AppState`].
pub struct Server {
    state: Arc<AppState>,
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Server {
    /// Spawns the approval finder, plan-check runner, signal listener,
    /// webhook delivery and slow-query runner.
    pub async fn start(state: Arc<AppState>) -> Result<Self, ServerError> {
        Self::start_with_sink(state, Arc::new(LogSink)).await
    }

    pub async fn start_with_sink(
        state: Arc<AppState>,
        sink: Arc<dyn WebhookSink>,
    ) -> Result<Self, ServerError> {
        let receivers = state
            .scheduler
            .take_receivers()
            .ok_or(ServerError::AlreadyStarted)?;
        let deliveries = state
            .webhooks
            .take_receiver()
            .ok_or(ServerError::AlreadyStarted)?;
        let listener = state.signals.listener().await?;
        let config = &state.config;
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let approvals = ApprovalRunner::new(state.store.clone(), state.approvals.clone());
        tasks.push((
            "approval",
            tokio::spawn(approvals.run(
                receivers.approval_check,
                config.runner_interval(),
                shutdown.clone(),
            )),
        ));

        let checks = PlanCheckRunner::new(
            state.store.clone(),
            state.scheduler.clone(),
            Arc::new(ExecutorRegistry::builtin()),
        )
        .with_max_concurrent(config.max_concurrent_plan_checks);
        tasks.push((
            "plan_check",
            tokio::spawn(checks.run(
                receivers.plan_check_tickle,
                config.plan_check_interval(),
                shutdown.clone(),
            )),
        ));

        tasks.push((
            "signal",
            tokio::spawn(listener.run(
                state.scheduler.clone(),
                config.signal_poll_interval(),
                shutdown.clone(),
            )),
        ));

        tasks.push((
            "webhook",
            tokio::spawn(run_delivery(
                deliveries,
                sink,
                config.webhook_timeout(),
                shutdown.clone(),
            )),
        ));

        let slow_queries = SlowQueryRunner::new(state.store.clone());
        tasks.push((
            "slow_query",
            tokio::spawn(slow_queries.run(
                receivers.slow_query_sync,
                config.runner_interval(),
                shutdown.clone(),
            )),
        ));

        info!(replica = %state.signals.replica_id(), "Server started");
        Ok(Self {
            state,
            shutdown,
            tasks,
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Cancels every task and waits for them, up to a fixed timeout each.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for (name, task) in self.tasks {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, "Background task panicked: {}", e),
                Err(_) => warn!(task = name, "Background task did not stop in time"),
            }
        }
        info!("Server stopped");
    }
}

/// Runs the background tasks until Ctrl-C.
pub async fn serve(state: Arc<AppState>) -> Result<(), ServerError> {
    let server = Server::start(state).await?;
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutdown requested");
    server.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_database_path_resolution() {
        let home = Path::new("/srv/changeflow");
        let mut config = SystemConfig::default();
        assert_eq!(
            database_path(&config, home),
            PathBuf::from("/srv/changeflow/changeflow.db")
        );
        config.database_path = PathBuf::from("/var/lib/cf.db");
        assert_eq!(database_path(&config, home), PathBuf::from("/var/lib/cf.db"));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = SystemConfig {
            runner_interval_secs: 1,
            plan_check_interval_secs: 1,
            signal_poll_interval_secs: 1,
            ..Default::default()
        };
        let state = open_state(config, dir.path()).await.unwrap();
        let server = Server::start(state.clone()).await.unwrap();
        assert!(matches!(
            Server::start(state).await,
            Err(ServerError::AlreadyStarted)
        ));
        server.shutdown().await;
    }
}
