//! Filesystem concerns of a container: bind mounts.

pub mod volume;

pub use volume::{BindMount, parse_binds};
