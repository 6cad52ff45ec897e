use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::jobs::Job;

/// Lifecycle notifications for whoever relays status to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    InstanceOnline {
        instance: String,
        port: u16,
    },
    InstanceOffline {
        instance: String,
        fatal: bool,
    },
    InstanceRestarting {
        instance: String,
        attempt: u32,
        reason: String,
    },
    DeployStarted {
        instance: String,
        artifact: PathBuf,
    },
    DeploySucceeded {
        instance: String,
        port: u16,
        artifact: PathBuf,
    },
    DeployFailed {
        instance: String,
        reason: String,
    },
    JobStatusChanged(Job),
}

impl LifecycleEvent {
    pub fn instance(&self) -> &str {
        match self {
            LifecycleEvent::InstanceOnline { instance, .. }
            | LifecycleEvent::InstanceOffline { instance, .. }
            | LifecycleEvent::InstanceRestarting { instance, .. }
            | LifecycleEvent::DeployStarted { instance, .. }
            | LifecycleEvent::DeploySucceeded { instance, .. }
            | LifecycleEvent::DeployFailed { instance, .. } => instance,
            LifecycleEvent::JobStatusChanged(job) => &job.instance_id,
        }
    }

    /// Operator-facing one-line rendering; `None` for events not worth a chat line.
    pub fn render(&self) -> Option<String> {
        let text = match self {
            LifecycleEvent::InstanceOnline { instance, port } => {
                format!("[{}] online on port {}", instance, port)
            }
            LifecycleEvent::InstanceOffline {
                instance,
                fatal: false,
            } => format!("[{}] offline", instance),
            LifecycleEvent::InstanceOffline {
                instance,
                fatal: true,
            } => format!(
                "[{}] offline: restart limit reached, operator action required",
                instance
            ),
            LifecycleEvent::InstanceRestarting {
                instance,
                attempt,
                reason,
            } => format!("[{}] restarting (attempt {}): {}", instance, attempt, reason),
            LifecycleEvent::DeployStarted { instance, artifact } => {
                format!("[{}] deploying {}", instance, artifact.display())
            }
            LifecycleEvent::DeploySucceeded {
                instance,
                port,
                artifact,
            } => format!(
                "[{}] deployed {} (now on port {})",
                instance,
                artifact.display(),
                port
            ),
            LifecycleEvent::DeployFailed { instance, reason } => {
                format!("[{}] deploy failed: {}", instance, reason)
            }
            LifecycleEvent::JobStatusChanged(_) => return None,
        };
        Some(text)
    }
}

/// Fan-out of lifecycle events. Emitting never blocks; slow subscribers
/// observe `Lagged` and skip ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: LifecycleEvent) {
        trace!(?event, "lifecycle event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}
