//! Bind mounts given with `-v`.
//!
//! Mounts are validated when the container is created; performing them is
//! the isolation context's job.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use berth_common::{BerthError, BerthResult};
use serde::{Deserialize, Serialize};

/// A host directory bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Host path.
    pub source: PathBuf,
    /// Container mount point.
    pub destination: PathBuf,
    /// Read-only mount.
    pub read_only: bool,
}

impl BindMount {
    fn invalid(spec: &str, reason: impl Into<String>) -> BerthError {
        BerthError::InvalidBindMount {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }

    /// Check the source against the host filesystem.
    ///
    /// # Errors
    ///
    /// Rejects a missing source and the filesystem root.
    pub fn validate(&self) -> BerthResult<()> {
        let spec = self.to_string();
        let resolved = self.source.canonicalize().map_err(|e| {
            Self::invalid(&spec, format!("source {} does not exist: {e}", self.source.display()))
        })?;

        if resolved == Path::new("/") {
            return Err(Self::invalid(&spec, "the filesystem root cannot be bind mounted"));
        }

        Ok(())
    }
}

impl FromStr for BindMount {
    type Err = BerthError;

    /// Parse `SOURCE:DESTINATION[:ro|rw]`.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (source, destination, mode) = match parts.as_slice() {
            [source, destination] => (*source, *destination, None),
            [source, destination, mode] => (*source, *destination, Some(*mode)),
            _ => return Err(Self::invalid(spec, "expected SOURCE:DESTINATION[:MODE]")),
        };

        if source.is_empty() || destination.is_empty() {
            return Err(Self::invalid(spec, "source and destination are required"));
        }
        if !destination.starts_with('/') {
            return Err(Self::invalid(spec, "destination must be an absolute path"));
        }

        let read_only = match mode {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(other) => return Err(Self::invalid(spec, format!("unknown mode {other:?}"))),
        };

        Ok(Self {
            source: PathBuf::from(source),
            destination: PathBuf::from(destination),
            read_only,
        })
    }
}

impl fmt::Display for BindMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source.display(), self.destination.display())?;
        if self.read_only {
            f.write_str(":ro")?;
        }
        Ok(())
    }
}

/// Parse and validate every `-v` argument.
///
/// # Errors
///
/// Returns the first invalid mount.
pub fn parse_binds(specs: &[String]) -> BerthResult<Vec<BindMount>> {
    specs
        .iter()
        .map(|spec| {
            let bind: BindMount = spec.parse()?;
            bind.validate()?;
            Ok(bind)
        })
        .collect()
}
