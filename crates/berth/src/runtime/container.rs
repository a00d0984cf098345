//! Container data model.

use std::path::PathBuf;

use berth_common::ContainerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filesystem::BindMount;

/// Search path given to every container unless overridden.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// What to run and how. Fixed at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Image reference, recorded as given.
    pub image: String,
    /// Program and arguments.
    pub cmd: Vec<String>,
    /// Extra `KEY=VALUE` entries, applied after the defaults.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// User name or uid to run as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    /// Hostname inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Default gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Run on a pseudo-terminal.
    #[serde(default)]
    pub tty: bool,
    /// Keep stdin open for attach sessions.
    #[serde(default)]
    pub open_stdin: bool,
    /// Remove the container once it exits.
    #[serde(default)]
    pub auto_remove: bool,
    /// Validated bind mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<BindMount>,
    /// Where to record the full id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidfile: Option<PathBuf>,
}

impl ContainerConfig {
    /// Configuration running `cmd` from `image`.
    pub fn new(image: impl Into<String>, cmd: Vec<String>) -> Self {
        Self {
            image: image.into(),
            cmd,
            ..Default::default()
        }
    }

    /// The full environment handed to the bootstrap.
    #[must_use]
    pub fn environment(&self) -> Vec<String> {
        let mut env = vec![format!("PATH={DEFAULT_PATH}"), "HOME=/".to_string()];
        if let Some(hostname) = &self.hostname {
            env.push(format!("HOSTNAME={hostname}"));
        }
        if self.tty {
            env.push("TERM=xterm".to_string());
        }
        env.extend(self.env.iter().cloned());
        env
    }
}

/// Container status. Transitions are driven by the monitor only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Created, process not started.
    Created,
    /// Process running.
    Running,
    /// Process gone.
    Exited {
        /// Exit status, or 128 + signal.
        exit_code: i32,
    },
    /// Deleted from the registry.
    Removed,
}

impl ContainerStatus {
    /// Whether `next` is the single allowed successor of this status.
    #[must_use]
    pub const fn can_transition_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running)
                | (Self::Running, Self::Exited { .. })
                | (Self::Exited { .. }, Self::Removed)
        )
    }

    /// Returns true if the process is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true once the process is gone.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::Removed)
    }

    /// Exit code, if exited.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { exit_code } => Some(*exit_code),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited { exit_code } => write!(f, "exited ({exit_code})"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// Persisted view of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Full id.
    pub id: ContainerId,
    /// Creation-time configuration.
    pub config: ContainerConfig,
    /// Current status.
    pub status: ContainerStatus,
    /// Process id while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// Exit time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl ContainerRecord {
    /// A freshly created container.
    #[must_use]
    pub fn new(id: ContainerId, config: ContainerConfig) -> Self {
        Self {
            id,
            config,
            status: ContainerStatus::Created,
            pid: None,
            created: Utc::now(),
            started: None,
            finished: None,
        }
    }

    /// Apply a status change and its timestamps.
    pub fn apply(&mut self, status: ContainerStatus) {
        match status {
            ContainerStatus::Running => self.started = Some(Utc::now()),
            ContainerStatus::Exited { .. } => {
                self.finished = Some(Utc::now());
                self.pid = None;
            }
            ContainerStatus::Created | ContainerStatus::Removed => {}
        }
        self.status = status;
    }
}
