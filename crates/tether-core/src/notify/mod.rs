//! Outbound notifications.
//!
//! Reconcilers publish lifecycle events to an outbox; a dispatcher task
//! drains it and delivers HTTP POSTs to the sinks each tenant declared in
//! its NamespacePolicy. Delivery is fully decoupled from reconcile
//! commits: publishing never blocks, and a failed delivery can never
//! revert a committed transition — it is retried with capped exponential
//! backoff and then logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backoff::ExponentialBackoff;
use crate::error::Result;
use crate::resource::policy::NamespacePolicy;
use crate::store::TypedStore;

/// The closed set of notification events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationEvent {
    /// A session was admitted.
    #[serde(rename = "session.created")]
    SessionCreated,
    /// A session's workload started running.
    #[serde(rename = "session.started")]
    SessionStarted,
    /// A session completed successfully.
    #[serde(rename = "session.completed")]
    SessionCompleted,
    /// A session failed, stopped, or timed out.
    #[serde(rename = "session.failed")]
    SessionFailed,
    /// A gated session was approved.
    #[serde(rename = "session.approved")]
    SessionApproved,
    /// A gated session was rejected.
    #[serde(rename = "session.rejected")]
    SessionRejected,
    /// Budget consumption crossed the warning threshold.
    #[serde(rename = "budget.warning")]
    BudgetWarning,
    /// Budget consumption crossed the ceiling.
    #[serde(rename = "budget.exceeded")]
    BudgetExceeded,
}

impl NotificationEvent {
    /// All event names, for validation of sink filters.
    pub const ALL: [Self; 8] = [
        Self::SessionCreated,
        Self::SessionStarted,
        Self::SessionCompleted,
        Self::SessionFailed,
        Self::SessionApproved,
        Self::SessionRejected,
        Self::BudgetWarning,
        Self::BudgetExceeded,
    ];

    /// The wire name of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionCreated => "session.created",
            Self::SessionStarted => "session.started",
            Self::SessionCompleted => "session.completed",
            Self::SessionFailed => "session.failed",
            Self::SessionApproved => "session.approved",
            Self::SessionRejected => "session.rejected",
            Self::BudgetWarning => "budget.warning",
            Self::BudgetExceeded => "budget.exceeded",
        }
    }

    /// Whether `name` is a member of the closed event set.
    #[must_use]
    pub fn is_valid_name(name: &str) -> bool {
        Self::ALL.iter().any(|e| e.as_str() == name)
    }
}

impl std::fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One notification to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Tenant whose sinks receive this.
    pub tenant: String,
    /// What happened.
    pub event: NotificationEvent,
    /// The session concerned, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// When the originating transition committed.
    pub timestamp: DateTime<Utc>,
    /// Event-specific detail.
    #[serde(default)]
    pub data: Value,
}

/// Transport that delivers one notification to one sink URL.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Delivers `notification` to `url`.
    async fn deliver(&self, url: &str, notification: &Notification) -> Result<()>;
}

/// Handle reconcilers use to publish notifications. Cheap to clone;
/// publishing is non-blocking.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Outbox {
    /// Creates an outbox and the receiving end for a dispatcher.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publishes a notification. Errors (dispatcher gone) are swallowed:
    /// notification loss must never affect the caller's commit.
    pub fn publish(
        &self,
        tenant: &str,
        event: NotificationEvent,
        session_id: Option<&str>,
        data: Value,
    ) {
        let notification = Notification {
            tenant: tenant.to_string(),
            event,
            session_id: session_id.map(ToString::to_string),
            timestamp: Utc::now(),
            data,
        };
        if self.tx.send(notification).is_err() {
            tracing::warn!(tenant, event = %event, "notification dropped: dispatcher not running");
        }
    }

    /// An outbox whose notifications go nowhere. For tests and tools.
    #[must_use]
    pub fn disconnected() -> Self {
        let (outbox, _rx) = Self::channel();
        outbox
    }
}

/// Delivery retry policy: 5 attempts, 1 s initial, 60 s cap.
const DELIVERY_ATTEMPTS: u32 = 5;

fn delivery_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial: std::time::Duration::from_secs(1),
        max: std::time::Duration::from_secs(60),
        multiplier: 2.0,
        jitter: 0.1,
    }
}

/// Drains the outbox and delivers to tenant-declared sinks.
pub struct Dispatcher {
    policies: Arc<TypedStore<NamespacePolicy>>,
    sink: Arc<dyn NotificationSink>,
}

impl Dispatcher {
    /// Creates a dispatcher reading sink configuration from `policies`.
    #[must_use]
    pub fn new(policies: Arc<TypedStore<NamespacePolicy>>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { policies, sink }
    }

    /// Spawns the dispatch loop. The task exits when the outbox closes.
    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<Notification>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                self.dispatch(&notification).await;
            }
            tracing::debug!("notification dispatcher stopped");
        })
    }

    /// Delivers one notification to every matching sink.
    async fn dispatch(&self, notification: &Notification) {
        let Some(policy) = self
            .policies
            .get(&notification.tenant, crate::resource::POLICY_NAME)
        else {
            return;
        };

        for sink in &policy.resource.spec.notifications.webhooks {
            let wants = sink.events.is_empty()
                || sink.events.iter().any(|e| e == notification.event.as_str());
            if !wants {
                continue;
            }
            self.deliver_with_retry(&sink.url, notification).await;
        }
    }

    async fn deliver_with_retry(&self, url: &str, notification: &Notification) {
        let backoff = delivery_backoff();
        for attempt in 1..=DELIVERY_ATTEMPTS {
            match self.sink.deliver(url, notification).await {
                Ok(()) => {
                    tracing::debug!(
                        tenant = %notification.tenant,
                        event = %notification.event,
                        url,
                        "notification delivered"
                    );
                    return;
                }
                Err(e) if attempt < DELIVERY_ATTEMPTS => {
                    let delay = backoff.jittered_delay(attempt);
                    tracing::debug!(
                        tenant = %notification.tenant,
                        event = %notification.event,
                        url,
                        attempt,
                        error = %e,
                        "notification delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        tenant = %notification.tenant,
                        event = %notification.event,
                        url,
                        error = %e,
                        "notification delivery abandoned"
                    );
                }
            }
        }
    }
}
