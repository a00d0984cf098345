//! Runtime event definitions and bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Runtime event types.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    /// Container created.
    ContainerCreated { id: String, timestamp: i64 },
    /// Container process started.
    ContainerStarted { id: String, pid: u32, timestamp: i64 },
    /// Container process exited.
    ContainerExited { id: String, exit_code: i32, timestamp: i64 },
    /// Container removed from the registry.
    ContainerRemoved { id: String, timestamp: i64 },
}

impl RuntimeEvent {
    /// Id of the container the event is about.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::ContainerCreated { id, .. }
            | Self::ContainerStarted { id, .. }
            | Self::ContainerExited { id, .. }
            | Self::ContainerRemoved { id, .. } => id,
        }
    }
}

/// Event bus for runtime events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: RuntimeEvent) {
        // Ignore SendError (no subscribers)
        let _ = self.sender.send(event);
    }
}
