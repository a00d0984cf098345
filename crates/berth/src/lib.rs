//! # Berth Container Runtime
//!
//! Berth runs a command inside a pre-built isolation context and lets
//! clients attach to it, detach from it and collect its exit.
//!
//! ## Pieces
//!
//! - **Bootstrap**: `berth init`, the first code inside a new container.
//!   Environment, default route, working directory, privilege drop, exec.
//! - **Attach**: [`attach::StreamSession`] pairs client and container
//!   streams with a detach escape sequence.
//! - **Monitor**: [`runtime::RuntimeMonitor`] owns container lifecycle.
//! - **Facade**: [`facade::CommandFacade`] backs the CLI commands.
//! - **Shim**: [`shim`] keeps a container supervised after the CLI exits.
//!
//! ## Usage
//!
//! ```no_run
//! use berth::exec::ClientStreams;
//! use berth::facade::{CommandFacade, RunOptions};
//! use berth::runtime::{ContainerConfig, RuntimeConfig, RuntimeMonitor};
//!
//! # async fn example() -> berth_common::BerthResult<()> {
//! let facade = CommandFacade::new(RuntimeMonitor::new(RuntimeConfig::default()));
//!
//! let config = ContainerConfig::new("base", vec!["echo".into(), "hello".into()]);
//! let outcome = facade.run(RunOptions::new(config), ClientStreams::stdio()).await?;
//! println!("exit code: {:?}", outcome.exit_code);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod attach;
pub mod bootstrap;
pub mod cli;
pub mod exec;
pub mod facade;
pub mod filesystem;
pub mod runtime;
pub mod shim;

pub use facade::CommandFacade;
pub use runtime::RuntimeMonitor;
