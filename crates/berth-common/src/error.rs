//! Error taxonomy shared by every Berth crate.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`BerthError`].
pub type BerthResult<T> = Result<T, BerthError>;

/// Exit status reserved for "requested program not found" during bootstrap.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Common errors across the Berth ecosystem.
#[derive(Error, Diagnostic, Debug)]
pub enum BerthError {
    /// No container matches the given id or prefix.
    #[error("No such container: {id}")]
    #[diagnostic(code(berth::container::not_found))]
    ContainerNotFound {
        /// The id or prefix that was looked up.
        id: String,
    },

    /// An id prefix matched more than one container.
    #[error("Ambiguous container id prefix {prefix}: {matches} containers match")]
    #[diagnostic(
        code(berth::container::ambiguous_id),
        help("Use a longer prefix or the full 64 character id")
    )]
    AmbiguousId {
        /// The prefix that was looked up.
        prefix: String,
        /// How many containers share it.
        matches: usize,
    },

    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(berth::container::invalid_id),
        help("Container IDs are 64 lowercase hexadecimal characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// The container is not in a state that allows the operation.
    #[error("Cannot {operation} container {id}: container is {status}")]
    #[diagnostic(code(berth::container::invalid_state))]
    InvalidState {
        /// Container id.
        id: String,
        /// Current status.
        status: String,
        /// Attempted operation.
        operation: String,
    },

    /// A bind mount was rejected before container start.
    #[error("Invalid bind mount {spec}: {reason}")]
    #[diagnostic(
        code(berth::volume::invalid_bind),
        help("Bind mounts are written as SOURCE:DESTINATION[:ro] with an existing, non-root SOURCE")
    )]
    InvalidBindMount {
        /// The mount as given by the caller.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },

    /// `wait` gave up before the container exited.
    #[error("Timed out after {timeout_ms}ms waiting for container {id}")]
    #[diagnostic(code(berth::container::wait_timeout))]
    WaitTimeout {
        /// Container id.
        id: String,
        /// The timeout that elapsed.
        timeout_ms: u128,
    },

    /// A bootstrap step failed. The container start is abandoned.
    #[error("Bootstrap failed at {step}: {message}")]
    #[diagnostic(code(berth::bootstrap::fatal))]
    Bootstrap {
        /// Step that failed.
        step: String,
        /// The error message.
        message: String,
    },

    /// The requested program is not on the search path.
    #[error("Unable to locate {command}")]
    #[diagnostic(code(berth::bootstrap::command_not_found))]
    CommandNotFound {
        /// The program name.
        command: String,
    },

    /// A real I/O failure on an attach stream (not a clean end of stream).
    #[error("Stream error ({direction}): {source}")]
    #[diagnostic(code(berth::attach::stream))]
    Stream {
        /// Copy direction, e.g. `client->container`.
        direction: &'static str,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The detached supervisor of a container failed or went away.
    #[error("Supervisor error: {message}")]
    #[diagnostic(
        code(berth::supervisor),
        help("The supervisor log is shim.log in the container directory")
    )]
    Supervisor {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(berth::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(berth::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(berth::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(berth::internal), help("This is a bug, please report it"))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl BerthError {
    /// Shorthand for a fatal bootstrap error.
    pub fn bootstrap(step: impl std::fmt::Display, message: impl std::fmt::Display) -> Self {
        Self::Bootstrap {
            step: step.to_string(),
            message: message.to_string(),
        }
    }

    /// Shorthand for a supervisor failure.
    pub fn supervisor(message: impl std::fmt::Display) -> Self {
        Self::Supervisor {
            message: message.to_string(),
        }
    }

    /// Process exit status the bootstrap should terminate with for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::CommandNotFound { .. } => EXIT_COMMAND_NOT_FOUND,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for BerthError {
    fn from(err: serde_json::Error) -> Self {
        BerthError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = BerthError::ContainerNotFound {
            id: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "No such container: abc123");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BerthError = io_err.into();
        assert!(matches!(err, BerthError::Io(_)));
    }

    #[test]
    fn command_not_found_has_reserved_exit_code() {
        let err = BerthError::CommandNotFound {
            command: "nope".to_string(),
        };
        assert_eq!(err.exit_code(), 127);
        assert_eq!(BerthError::bootstrap("workdir", "boom").exit_code(), 1);
    }
}
