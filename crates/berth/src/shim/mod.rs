//! Detached supervision.
//!
//! `berth run` hands each container to a `berth shim` process running in a
//! session of its own. The shim owns the container's stdio, writes its log
//! and records its exit, so the container outlives the command that
//! created it. Clients attach through the shim's unix socket using the
//! framing in [`protocol`].

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{attach, spawn};
pub use protocol::{Frame, Hello, SessionSummary};
pub use server::{ReadyLine, serve};
