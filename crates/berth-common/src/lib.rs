//! # berth-common
//!
//! Shared utilities and types for the Berth container runtime:
//! - Container ID generation and truncation
//! - Standard filesystem paths
//! - The error taxonomy

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{BerthError, BerthResult, EXIT_COMMAND_NOT_FOUND};
pub use id::{ContainerId, truncate_id};
pub use paths::{BerthPaths, ENV_SENTINEL};
