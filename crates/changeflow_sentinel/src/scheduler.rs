//! Process-wide scheduler state.
//!
//! Producers never block: every send is a `try_send` and a full or closed
//! channel drops the message with a debug log. Consumers take their
//! receivers once, at start-up, through [`Scheduler::take_receivers`].

use crate::cancel::CancellationToken;
use changeflow_ids::InstanceId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Receiving ends of the scheduler channels.
pub struct SchedulerReceivers {
    /// Issue uids whose approval template should be found.
    pub approval_check: mpsc::Receiver<i64>,
    /// Wake-ups for the plan-check runner.
    pub plan_check_tickle: mpsc::Receiver<()>,
    /// Instances whose slow-query log should be synced.
    pub slow_query_sync: mpsc::Receiver<InstanceId>,
}

pub struct Scheduler {
    approval_check: mpsc::Sender<i64>,
    plan_check_tickle: mpsc::Sender<()>,
    slow_query_sync: mpsc::Sender<InstanceId>,
    receivers: Mutex<Option<SchedulerReceivers>>,
    running_plan_checks: Mutex<HashMap<i64, CancellationToken>>,
}

/// A run registered by [`Scheduler::claim_plan_check`]. Dropping the claim
/// removes the run from the registry, also when its execution unwinds.
pub struct PlanCheckClaim {
    scheduler: Arc<Scheduler>,
    run_uid: i64,
    token: CancellationToken,
}

impl PlanCheckClaim {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for PlanCheckClaim {
    fn drop(&mut self) {
        self.scheduler.unregister_plan_check(self.run_uid);
    }
}

fn best_effort<T>(channel: &'static str, result: Result<(), TrySendError<T>>) -> bool {
    match result {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            debug!("Channel {} full, dropping message", channel);
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Channel {} closed, dropping message", channel);
            false
        }
    }
}

impl Scheduler {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (approval_tx, approval_rx) = mpsc::channel(capacity);
        // A single pending wake-up is enough for the tickle channel.
        let (tickle_tx, tickle_rx) = mpsc::channel(1);
        let (slow_tx, slow_rx) = mpsc::channel(capacity);
        Self {
            approval_check: approval_tx,
            plan_check_tickle: tickle_tx,
            slow_query_sync: slow_tx,
            receivers: Mutex::new(Some(SchedulerReceivers {
                approval_check: approval_rx,
                plan_check_tickle: tickle_rx,
                slow_query_sync: slow_rx,
            })),
            running_plan_checks: Mutex::new(HashMap::new()),
        }
    }

    /// Hands out the receivers. Returns `None` after the first call.
    pub fn take_receivers(&self) -> Option<SchedulerReceivers> {
        lock(&self.receivers).take()
    }

    pub fn signal_approval_check(&self, issue_uid: i64) -> bool {
        best_effort("approval_check", self.approval_check.try_send(issue_uid))
    }

    pub fn tickle_plan_check(&self) -> bool {
        match self.plan_check_tickle.try_send(()) {
            Ok(()) => true,
            // A wake-up is already queued.
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => {
                debug!("Channel plan_check_tickle closed, dropping tickle");
                false
            }
        }
    }

    pub fn request_slow_query_sync(&self, instance: InstanceId) -> bool {
        best_effort("slow_query_sync", self.slow_query_sync.try_send(instance))
    }

    // ========================================================================
    // Running plan-check registry
    // ========================================================================

    /// Registers a run and returns its token. Returns `None` if the run is
    /// already registered.
    pub fn register_plan_check(&self, run_uid: i64) -> Option<CancellationToken> {
        let mut running = lock(&self.running_plan_checks);
        if running.contains_key(&run_uid) {
            return None;
        }
        let token = CancellationToken::new();
        running.insert(run_uid, token.clone());
        Some(token)
    }

    /// Like [`Scheduler::register_plan_check`], but the registration lives
    /// only as long as the returned claim.
    pub fn claim_plan_check(self: &Arc<Self>, run_uid: i64) -> Option<PlanCheckClaim> {
        let token = self.register_plan_check(run_uid)?;
        Some(PlanCheckClaim {
            scheduler: Arc::clone(self),
            run_uid,
            token,
        })
    }

    pub fn unregister_plan_check(&self, run_uid: i64) {
        lock(&self.running_plan_checks).remove(&run_uid);
    }

    /// Fires the cancel token of a locally running run. Returns `false`
    /// when this process is not executing the run.
    pub fn cancel_plan_check(&self, run_uid: i64) -> bool {
        match lock(&self.running_plan_checks).get(&run_uid) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_plan_check_running(&self, run_uid: i64) -> bool {
        lock(&self.running_plan_checks).contains_key(&run_uid)
    }

    pub fn running_plan_checks(&self) -> Vec<i64> {
        let mut uids: Vec<i64> = lock(&self.running_plan_checks).keys().copied().collect();
        uids.sort_unstable();
        uids
    }
}

// Every critical section is a single map operation, so a poisoned map is
// still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
