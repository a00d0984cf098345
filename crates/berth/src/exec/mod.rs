//! Process execution: spawning the bootstrap, terminals and container stdio.

pub mod process;
pub mod pty;
pub mod stdio;

pub use process::{LaunchedProcess, ProcessLauncher};
pub use pty::PtyPair;
pub use stdio::{
    BoxedReader, BoxedWriter, ClientStreams, ContainerStdin, ContainerStreams, OutputHub,
    StreamKind, pump_output,
};
