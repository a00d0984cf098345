//! Container runtime core.
//!
//! [`RuntimeMonitor`] owns the registry and drives every lifecycle
//! transition. Records are persisted by [`StateManager`] so read-only
//! commands work without the monitor.

mod config;
mod container;
pub mod events;
pub mod logs;
mod monitor;
mod state;

pub use config::RuntimeConfig;
pub use container::{ContainerConfig, ContainerRecord, ContainerStatus, DEFAULT_PATH};
pub use events::{EventBus, RuntimeEvent};
pub use logs::{JsonLogWriter, LogEntry, read_log};
pub use monitor::RuntimeMonitor;
pub use state::StateManager;
