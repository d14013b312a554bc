use changeflow_db::Store;
use changeflow_ids::InstanceId;
use changeflow_sentinel::CancellationToken;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Consumer of slow-query sync requests. Stamps each requested instance
/// with the time of its latest sync.
pub struct SlowQueryRunner {
    store: Store,
}

impl SlowQueryRunner {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn sync(&self, instance: &InstanceId) {
        match self.store.mark_slow_query_synced(instance, Utc::now()).await {
            Ok(()) => info!(instance = %instance, "Slow queries synced"),
            Err(e) => warn!(instance = %instance, "Slow query sync failed: {}", e),
        }
    }

    pub async fn run(
        self,
        mut rx: mpsc::Receiver<InstanceId>,
        poll: Duration,
        shutdown: CancellationToken,
    ) {
        info!("Slow query runner started");
        while !shutdown.is_cancelled() {
            match tokio::time::timeout(poll, rx.recv()).await {
                Ok(Some(instance)) => self.sync(&instance).await,
                Ok(None) => break,
                Err(_) => {}
            }
        }
        info!("Slow query runner stopped");
    }
}
