//! Attach/detach protocol.
//!
//! A [`StreamSession`] pairs a client's standard streams with a container's
//! for one attach. Client input is scanned for the detach sequence; what a
//! closed client input means for the container depends on TTY mode.

pub mod escape;
pub mod session;

pub use escape::{DetachKeys, EscapeScanner, Scan};
pub use session::{SessionEnd, SessionOptions, StreamSession};
