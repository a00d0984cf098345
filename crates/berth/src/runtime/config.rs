//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use berth_common::BerthPaths;

use crate::attach::DetachKeys;

/// Runtime configuration options.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Paths for runtime data.
    pub paths: BerthPaths,
    /// Binary re-executed as `init` to bootstrap each container.
    pub init_path: PathBuf,
    /// Default detach sequence for attach sessions.
    pub detach_keys: DetachKeys,
    /// How long to wait for output to drain after the process exits.
    pub drain_timeout: Duration,
    /// Whether to use rootless mode.
    pub rootless: bool,
    /// Binary run as `shim` to supervise containers out of process.
    /// Containers stay in this process when unset.
    pub supervisor: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: BerthPaths::new(),
            init_path: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("berth")),
            detach_keys: DetachKeys::default(),
            drain_timeout: Duration::from_secs(2),
            rootless: false,
            supervisor: None,
        }
    }
}

impl RuntimeConfig {
    /// Create a rootless configuration.
    #[must_use]
    pub fn rootless() -> Self {
        let root = dirs::data_local_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("berth");

        Self {
            paths: BerthPaths::with_root(root),
            rootless: true,
            ..Self::default()
        }
    }

    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = BerthPaths::with_root(root);
        self
    }

    /// Set the bootstrap binary.
    #[must_use]
    pub fn with_init_path(mut self, init_path: impl Into<PathBuf>) -> Self {
        self.init_path = init_path.into();
        self
    }

    /// Set the default detach sequence.
    #[must_use]
    pub fn with_detach_keys(mut self, keys: DetachKeys) -> Self {
        self.detach_keys = keys;
        self
    }

    /// Supervise containers with `program shim` instead of in process.
    #[must_use]
    pub fn with_supervisor(mut self, program: impl Into<PathBuf>) -> Self {
        self.supervisor = Some(program.into());
        self
    }

    /// Set the output drain timeout.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}
