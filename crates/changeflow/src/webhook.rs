//! Webhook facade.
//!
//! Services describe what happened as a [`WebhookEvent`]; the dispatcher
//! fans it out to every project webhook subscribed to the event type and
//! queues one [`WebhookDelivery`] each. Queueing is best-effort: a full
//! queue or a failed project lookup is logged and dropped. The delivery
//! runner hands queued deliveries to a [`WebhookSink`].

use crate::context::RequestContext;
use changeflow_db::Store;
use changeflow_ids::ProjectId;
use changeflow_protocol::{Issue, WebhookEventType};
use changeflow_sentinel::CancellationToken;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEvent {
    pub event_type: WebhookEventType,
    pub project: ProjectId,
    pub actor: String,
    pub title: String,
    pub description: String,
    pub issue: Option<IssueSummary>,
    /// Set for approval and stage events.
    pub step: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueSummary {
    pub name: String,
    pub title: String,
    pub status: String,
    pub issue_type: String,
    pub creator: String,
    pub approval_status: String,
}

impl IssueSummary {
    pub fn from_issue(issue: &Issue) -> Self {
        Self {
            name: issue.name().to_string(),
            title: issue.title.clone(),
            status: issue.status.to_string(),
            issue_type: issue.issue_type.to_string(),
            creator: issue.creator.clone(),
            approval_status: issue.approval_status().to_string(),
        }
    }
}

impl WebhookEvent {
    pub fn for_issue(event_type: WebhookEventType, ctx: &RequestContext, issue: &Issue) -> Self {
        Self {
            event_type,
            project: issue.project.clone(),
            actor: ctx.email().to_string(),
            title: issue.title.clone(),
            description: String::new(),
            issue: Some(IssueSummary::from_issue(issue)),
            step: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookDelivery {
    pub webhook: String,
    pub url: String,
    pub event: WebhookEvent,
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    store: Store,
    tx: mpsc::Sender<WebhookDelivery>,
    rx: Arc<Mutex<Option<mpsc::Receiver<WebhookDelivery>>>>,
}

impl WebhookDispatcher {
    pub fn new(store: Store, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            store,
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
        }
    }

    /// The delivery queue. Only the first caller gets it.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<WebhookDelivery>> {
        self.rx.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Queues `event` for every subscribed webhook of its project and
    /// returns how many deliveries were queued.
    pub async fn emit(&self, event: WebhookEvent) -> usize {
        let project = match self.store.get_project(&event.project).await {
            Ok(Some(project)) => project,
            Ok(None) => {
                debug!(project = %event.project, "Webhook skipped, project not found");
                return 0;
            }
            Err(e) => {
                warn!(project = %event.project, "Failed to load webhooks: {}", e);
                return 0;
            }
        };
        let mut queued = 0;
        for hook in project
            .webhooks
            .iter()
            .filter(|h| h.events.contains(&event.event_type))
        {
            let delivery = WebhookDelivery {
                webhook: hook.title.clone(),
                url: hook.url.clone(),
                event: event.clone(),
            };
            match self.tx.try_send(delivery) {
                Ok(()) => queued += 1,
                Err(e) => warn!(
                    event = %event.event_type,
                    webhook = %hook.title,
                    "Webhook delivery dropped: {}",
                    e
                ),
            }
        }
        queued
    }
}

/// Transport for queued deliveries.
pub trait WebhookSink: Send + Sync {
    fn deliver(&self, delivery: &WebhookDelivery, timeout: Duration) -> Result<(), String>;
}

/// Sink that records deliveries in the log.
pub struct LogSink;

impl WebhookSink for LogSink {
    fn deliver(&self, delivery: &WebhookDelivery, _timeout: Duration) -> Result<(), String> {
        let body = serde_json::to_string(&delivery.event).map_err(|e| e.to_string())?;
        info!(
            webhook = %delivery.webhook,
            url = %delivery.url,
            event = %delivery.event.event_type,
            "Webhook delivered: {}",
            body
        );
        Ok(())
    }
}

/// Drains the delivery queue until shutdown or until every sender is gone.
pub async fn run_delivery(
    mut rx: mpsc::Receiver<WebhookDelivery>,
    sink: Arc<dyn WebhookSink>,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    info!("Webhook delivery started");
    let poll = Duration::from_millis(500);
    while !shutdown.is_cancelled() {
        match tokio::time::timeout(poll, rx.recv()).await {
            Ok(Some(delivery)) => {
                if let Err(e) = sink.deliver(&delivery, timeout) {
                    warn!(webhook = %delivery.webhook, "Webhook delivery failed: {}", e);
                }
            }
            Ok(None) => break,
            Err(_) => {}
        }
    }
    info!("Webhook delivery stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use changeflow_protocol::{IamPolicy, Project, ProjectSettings, ProjectWebhook};
    use changeflow_security::Principal;
    use tempfile::TempDir;

    async fn dispatcher(capacity: usize) -> (WebhookDispatcher, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("hooks.db")).await.unwrap();
        store
            .create_project(&Project {
                id: ProjectId::parse("p1").unwrap(),
                title: "p1".into(),
                settings: ProjectSettings::default(),
                webhooks: vec![
                    ProjectWebhook {
                        title: "chat".into(),
                        url: "https://chat.example/hook".into(),
                        events: vec![WebhookEventType::IssueCreated],
                    },
                    ProjectWebhook {
                        title: "audit".into(),
                        url: "https://audit.example/hook".into(),
                        events: vec![
                            WebhookEventType::IssueCreated,
                            WebhookEventType::StageEnded,
                        ],
                    },
                ],
                policy: IamPolicy::default(),
                deleted: false,
            })
            .await
            .unwrap();
        (WebhookDispatcher::new(store, capacity), dir)
    }

    fn event(event_type: WebhookEventType) -> WebhookEvent {
        WebhookEvent {
            event_type,
            project: ProjectId::parse("p1").unwrap(),
            actor: RequestContext::new(Principal::new("bob@x")).email().to_string(),
            title: "t".into(),
            description: String::new(),
            issue: None,
            step: None,
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_subscribed_webhooks() {
        let (hooks, _dir) = dispatcher(8).await;
        let mut rx = hooks.take_receiver().unwrap();
        assert!(hooks.take_receiver().is_none());

        assert_eq!(hooks.emit(event(WebhookEventType::IssueCreated)).await, 2);
        assert_eq!(hooks.emit(event(WebhookEventType::StageEnded)).await, 1);
        assert_eq!(hooks.emit(event(WebhookEventType::IssueUpdated)).await, 0);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.webhook, "chat");
        assert_eq!(rx.recv().await.unwrap().webhook, "audit");
        assert_eq!(rx.recv().await.unwrap().event.event_type, WebhookEventType::StageEnded);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_error() {
        let (hooks, _dir) = dispatcher(1).await;
        assert_eq!(hooks.emit(event(WebhookEventType::IssueCreated)).await, 1);
    }

    #[tokio::test]
    async fn test_delivery_runner_stops_when_senders_are_gone() {
        let (hooks, _dir) = dispatcher(4).await;
        let rx = hooks.take_receiver().unwrap();
        hooks.emit(event(WebhookEventType::IssueCreated)).await;
        drop(hooks);
        run_delivery(
            rx,
            Arc::new(LogSink),
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .await;
    }
}
