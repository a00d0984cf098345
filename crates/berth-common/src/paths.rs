//! Standard filesystem paths for Berth.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Fixed location of the environment sentinel inside a container.
pub const ENV_SENTINEL: &str = "/.berthenv";

/// Default root directory for Berth data.
pub static BERTH_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("BERTH_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/berth"))
});

/// Standard paths used by the Berth runtime.
#[derive(Debug, Clone)]
pub struct BerthPaths {
    /// Root data directory (default: /var/lib/berth).
    pub root: PathBuf,
}

impl BerthPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for container data.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory for a specific container.
    #[must_use]
    pub fn container(&self, id: &str) -> PathBuf {
        self.containers().join(id)
    }

    /// Container state file.
    #[must_use]
    pub fn container_state(&self, id: &str) -> PathBuf {
        self.container(id).join("state.json")
    }

    /// Environment sentinel staged for the container's bootstrap.
    #[must_use]
    pub fn container_env(&self, id: &str) -> PathBuf {
        self.container(id).join("config.env")
    }

    /// Structured JSON log of the container's output.
    #[must_use]
    pub fn container_log(&self, id: &str) -> PathBuf {
        self.container(id).join(format!("{id}-json.log"))
    }

    /// Log of the supervisor process that owns the container.
    #[must_use]
    pub fn container_shim_log(&self, id: &str) -> PathBuf {
        self.container(id).join("shim.log")
    }

    /// Directory for attach sockets.
    #[must_use]
    pub fn sockets(&self) -> PathBuf {
        self.root.join("run")
    }

    /// Attach socket of a supervised container.
    ///
    /// Named by the short id: socket paths are limited to 108 bytes.
    #[must_use]
    pub fn container_socket(&self, id: &str) -> PathBuf {
        let short = id.get(..12).unwrap_or(id);
        self.sockets().join(format!("{short}.sock"))
    }

    /// Ensure the root directories exist.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.containers())?;
        std::fs::create_dir_all(self.sockets())
    }
}

impl Default for BerthPaths {
    fn default() -> Self {
        Self::with_root(BERTH_ROOT.clone())
    }
}
