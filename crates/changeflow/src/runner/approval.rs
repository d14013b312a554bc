use crate::approval::ApprovalEngine;
use crate::context::RequestContext;
use changeflow_db::Store;
use changeflow_sentinel::CancellationToken;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Approval finder. One issue uid per message; duplicates are harmless
/// because a finished finding is never redone.
pub struct ApprovalRunner {
    store: Store,
    engine: ApprovalEngine,
}

impl ApprovalRunner {
    pub fn new(store: Store, engine: ApprovalEngine) -> Self {
        Self { store, engine }
    }

    /// Issues left unresolved by a previous process.
    async fn pending(&self) -> Vec<i64> {
        match self.store.list_issues_pending_finding().await {
            Ok(uids) => uids,
            Err(e) => {
                error!("Failed to list issues pending approval finding: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn process(&self, issue_uid: i64) {
        let issue = match self.engine.find_and_apply(issue_uid).await {
            Ok(Some(issue)) => issue,
            Ok(None) => {
                debug!(issue = issue_uid, "Approval finding already done");
                return;
            }
            Err(e) => {
                warn!(issue = issue_uid, "Approval finding failed: {}", e);
                return;
            }
        };
        let ctx = RequestContext::system();
        if let Err(e) = self.engine.complete_grant_if_approved(&ctx, issue).await {
            warn!(issue = issue_uid, "Failed to complete approved grant: {}", e);
        }
    }

    pub async fn run(
        self,
        mut rx: mpsc::Receiver<i64>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        info!("Approval runner started");
        for uid in self.pending().await {
            self.process(uid).await;
        }
        while !shutdown.is_cancelled() {
            match tokio::time::timeout(interval, rx.recv()).await {
                Ok(Some(uid)) => self.process(uid).await,
                Ok(None) => break,
                // Pick up issues whose signal was dropped on a full channel.
                Err(_) => {
                    for uid in self.pending().await {
                        self.process(uid).await;
                    }
                }
            }
        }
        info!("Approval runner stopped");
    }
}
