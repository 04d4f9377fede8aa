//! Optional event notifications
//!
//! Webhook delivery is fire-and-forget: every event is handed to a spawned
//! task and a failed delivery is only logged.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ureq::Agent;

use crate::error::{Error, Result};
use crate::manifest::NotificationConfig;
use crate::sickbay::HealthState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Routes were announced
    Announce,
    /// Routes were withdrawn
    Withdraw,
    /// Any health state change
    Transition,
    /// Worker started, stopped, restarted or respawned
    Worker,
    /// A worker failed permanently
    Error,
    /// Daemon lifecycle
    Info,
}

/// Something worth telling the outside world about
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub check: Option<String>,
    pub title: String,
    pub message: String,
    pub previous: Option<HealthState>,
    pub current: Option<HealthState>,
    pub timestamp: SystemTime,
}

impl Event {
    pub fn new(kind: EventKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            check: None,
            title: title.into(),
            message: message.into(),
            previous: None,
            current: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn check(mut self, name: impl Into<String>) -> Self {
        self.check = Some(name.into());
        self
    }

    pub fn states(mut self, previous: HealthState, current: HealthState) -> Self {
        self.previous = Some(previous);
        self.current = Some(current);
        self
    }

    /// JSON body posted to webhooks
    pub fn to_json(&self) -> serde_json::Value {
        let timestamp = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        serde_json::json!({
            "event": self.kind,
            "check": self.check,
            "title": self.title,
            "message": self.message,
            "previous": self.previous.map(|s| s.to_string()),
            "current": self.current.map(|s| s.to_string()),
            "timestamp": timestamp,
        })
    }
}

/// A notification target
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Whether this target wants events of `kind`
    fn accepts(&self, kind: EventKind) -> bool;

    async fn deliver(&self, event: &Event) -> Result<()>;
}

/// JSON webhook target, POSTed with ureq on the blocking pool
pub struct Webhook {
    url: String,
    events: Vec<EventKind>,
    agent: Agent,
}

impl Webhook {
    pub fn new(config: &NotificationConfig) -> Self {
        let agent_config = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout)))
            .build();
        Self {
            url: config.url.clone(),
            events: config.events.clone(),
            agent: Agent::new_with_config(agent_config),
        }
    }
}

#[async_trait]
impl Notifier for Webhook {
    fn accepts(&self, kind: EventKind) -> bool {
        self.events.is_empty() || self.events.contains(&kind)
    }

    async fn deliver(&self, event: &Event) -> Result<()> {
        let agent = self.agent.clone();
        let url = self.url.clone();
        let body = event.to_json().to_string();

        tokio::task::spawn_blocking(move || {
            agent
                .post(&url)
                .header("Content-Type", "application/json")
                .send(body)
                .map(|_| ())
                .map_err(|e| Error::Notification(format!("{}: {}", url, e)))
        })
        .await
        .map_err(|e| Error::Notification(e.to_string()))?
    }
}

/// Fan-out to every configured target
#[derive(Clone, Default)]
pub struct Notifications {
    notifiers: Arc<Vec<Arc<dyn Notifier>>>,
}

impl Notifications {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            notifiers: Arc::new(notifiers),
        }
    }

    pub fn from_config(targets: &[NotificationConfig]) -> Self {
        Self::new(
            targets
                .iter()
                .map(|t| Arc::new(Webhook::new(t)) as Arc<dyn Notifier>)
                .collect(),
        )
    }

    /// Dispatch without waiting; must be called from inside the runtime
    pub fn emit(&self, event: Event) {
        if self.notifiers.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(title = %event.title, "No runtime, notification dropped");
            return;
        };

        let event = Arc::new(event);
        for notifier in self.notifiers.iter().filter(|n| n.accepts(event.kind)) {
            let notifier = Arc::clone(notifier);
            let event = Arc::clone(&event);
            runtime.spawn(async move {
                if let Err(e) = notifier.deliver(&event).await {
                    warn!(error = %e, title = %event.title, "Notification delivery failed");
                }
            });
        }
    }
}
