//! Replica signals carried through the store.
//!
//! A replica that cancels a plan-check run it is not executing itself
//! still needs the executing replica to stop. The canceller appends a row
//! to the signal log; every replica polls the log and applies rows written
//! by others.

use crate::cancel::CancellationToken;
use crate::error::{Result, SchedulerError};
use crate::scheduler::Scheduler;
use changeflow_db::{SignalRecord, Store};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const CANCEL_PLAN_CHECK_RUN: &str = "cancel_plan_check_run";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    CancelPlanCheckRun { uid: i64 },
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::CancelPlanCheckRun { .. } => CANCEL_PLAN_CHECK_RUN,
        }
    }

    fn payload(&self) -> String {
        match self {
            Signal::CancelPlanCheckRun { uid } => uid.to_string(),
        }
    }

    fn decode(record: &SignalRecord) -> Result<Self> {
        match record.kind.as_str() {
            CANCEL_PLAN_CHECK_RUN => {
                let uid = record.payload.parse::<i64>().map_err(|_| {
                    SchedulerError::InvalidSignal(format!(
                        "signal {} has non-numeric run uid {:?}",
                        record.id, record.payload
                    ))
                })?;
                Ok(Signal::CancelPlanCheckRun { uid })
            }
            other => Err(SchedulerError::InvalidSignal(format!(
                "signal {} has unknown kind {}",
                record.id, other
            ))),
        }
    }
}

#[derive(Clone)]
pub struct SignalBus {
    store: Store,
    replica_id: String,
}

impl SignalBus {
    pub fn new(store: Store, replica_id: impl Into<String>) -> Self {
        Self {
            store,
            replica_id: replica_id.into(),
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub async fn publish(&self, signal: Signal) -> Result<i64> {
        let id = self
            .store
            .insert_signal(signal.kind(), &signal.payload(), &self.replica_id)
            .await?;
        debug!(signal = id, kind = signal.kind(), "Signal published");
        Ok(id)
    }

    /// A listener positioned after every signal already in the log.
    pub async fn listener(&self) -> Result<SignalListener> {
        let cursor = self.store.max_signal_id().await?;
        Ok(SignalListener {
            store: self.store.clone(),
            replica_id: self.replica_id.clone(),
            cursor,
        })
    }
}

pub struct SignalListener {
    store: Store,
    replica_id: String,
    cursor: i64,
}

impl SignalListener {
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Signals written by other replicas since the last poll. Malformed rows
    /// are logged and skipped.
    pub async fn poll(&mut self) -> Result<Vec<Signal>> {
        let records = self.store.list_signals_after(self.cursor).await?;
        let mut signals = Vec::new();
        for record in records {
            self.cursor = self.cursor.max(record.id);
            if record.origin == self.replica_id {
                continue;
            }
            match Signal::decode(&record) {
                Ok(signal) => signals.push(signal),
                Err(e) => warn!("Skipping signal: {}", e),
            }
        }
        Ok(signals)
    }

    /// Polls once and applies the signals to the local scheduler.
    pub async fn apply(&mut self, scheduler: &Scheduler) -> Result<usize> {
        let signals = self.poll().await?;
        for signal in &signals {
            match signal {
                Signal::CancelPlanCheckRun { uid } => {
                    if scheduler.cancel_plan_check(*uid) {
                        info!(run = uid, "Plan check run canceled by peer replica");
                    }
                }
            }
        }
        Ok(signals.len())
    }

    pub async fn run(
        mut self,
        scheduler: Arc<Scheduler>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        info!(replica = %self.replica_id, "Signal listener started");
        while !shutdown.is_cancelled() {
            if let Err(e) = self.apply(&scheduler).await {
                error!("Signal poll failed: {}", e);
            }
            tokio::time::sleep(interval).await;
        }
        info!("Signal listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("signals.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_peer_cancel_fires_local_token() {
        let (store, _dir) = open_store().await;
        let local = SignalBus::new(store.clone(), "replica-a");
        let peer = SignalBus::new(store.clone(), "replica-b");

        let scheduler = Scheduler::new(4);
        let token = scheduler.register_plan_check(42).unwrap();
        let mut listener = local.listener().await.unwrap();

        peer.publish(Signal::CancelPlanCheckRun { uid: 42 }).await.unwrap();
        assert_eq!(listener.apply(&scheduler).await.unwrap(), 1);
        assert!(token.is_cancelled());

        // Nothing new on the next poll.
        assert_eq!(listener.apply(&scheduler).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_own_and_malformed_signals_are_skipped() {
        let (store, _dir) = open_store().await;
        let bus = SignalBus::new(store.clone(), "replica-a");
        let mut listener = bus.listener().await.unwrap();

        bus.publish(Signal::CancelPlanCheckRun { uid: 1 }).await.unwrap();
        store.insert_signal(CANCEL_PLAN_CHECK_RUN, "abc", "replica-b").await.unwrap();
        let last = store.insert_signal("unknown", "", "replica-b").await.unwrap();

        assert!(listener.poll().await.unwrap().is_empty());
        assert_eq!(listener.cursor(), last);
    }

    #[tokio::test]
    async fn test_listener_starts_after_existing_signals() {
        let (store, _dir) = open_store().await;
        let peer = SignalBus::new(store.clone(), "replica-b");
        peer.publish(Signal::CancelPlanCheckRun { uid: 1 }).await.unwrap();

        let mut listener = SignalBus::new(store, "replica-a").listener().await.unwrap();
        assert!(listener.poll().await.unwrap().is_empty());
        peer.publish(Signal::CancelPlanCheckRun { uid: 2 }).await.unwrap();
        assert_eq!(
            listener.poll().await.unwrap(),
            vec![Signal::CancelPlanCheckRun { uid: 2 }]
        );
    }
}
