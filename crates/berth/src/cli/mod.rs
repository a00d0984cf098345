//! CLI command definitions and handlers.

use std::path::PathBuf;

use berth_common::{BerthResult, ENV_SENTINEL};
use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};

use crate::attach::{DetachKeys, SessionEnd};
use crate::bootstrap::BootstrapOptions;
use crate::exec::ClientStreams;
use crate::facade::{AttachStreams, CommandFacade, RunOptions};
use crate::filesystem::parse_binds;
use crate::runtime::{ContainerConfig, ContainerRecord, RuntimeConfig, RuntimeMonitor};
use crate::shim;

mod terminal;

use terminal::RawTerminal;

/// Berth - lightweight container runtime
#[derive(Parser)]
#[command(name = "berth")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for berth data
    #[arg(long, global = true, env = "BERTH_ROOT")]
    pub root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Bootstrap a container process (internal)
    #[command(hide = true)]
    Init(InitArgs),

    /// Supervise a created container (internal)
    #[command(hide = true)]
    Shim {
        /// Hold the process back until the first client has attached
        #[arg(long)]
        attach_first: bool,

        /// Full container ID
        container_id: String,
    },

    /// Run a command in a new container
    #[command(disable_help_flag = true)]
    Run(Box<RunArgs>),

    /// Attach to a running container
    Attach {
        /// Container ID or unique prefix
        container_id: String,

        /// Override the detach sequence, e.g. ctrl-p,ctrl-q
        #[arg(long)]
        detach_keys: Option<DetachKeys>,
    },

    /// Block until containers stop, then print their exit codes
    Wait {
        /// Container IDs or unique prefixes
        #[arg(required = true)]
        container_ids: Vec<String>,
    },

    /// Kill running containers
    Kill {
        /// Container IDs or unique prefixes
        #[arg(required = true)]
        container_ids: Vec<String>,
    },

    /// Remove exited containers
    Rm {
        /// Container IDs or unique prefixes
        #[arg(required = true)]
        container_ids: Vec<String>,
    },

    /// List containers
    Ps {
        /// Show all containers, not only running ones
        #[arg(short, long)]
        all: bool,

        /// Only print container IDs
        #[arg(short, long)]
        quiet: bool,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Fetch the output of a container
    Logs {
        /// Container ID or unique prefix
        container_id: String,

        /// Keep printing new output until the container exits
        #[arg(short, long)]
        follow: bool,
    },
}

/// Arguments of `berth init`.
#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    /// User name or uid to run as
    #[arg(short, long)]
    pub user: Option<String>,

    /// Default gateway
    #[arg(short, long)]
    pub gateway: Option<String>,

    /// Working directory
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    /// Environment sentinel file
    #[arg(long, default_value = ENV_SENTINEL)]
    pub env_file: PathBuf,

    /// Program and arguments
    #[arg(last = true)]
    pub command: Vec<String>,
}

impl InitArgs {
    /// Bootstrap options and argv. `None` when no program was given.
    #[must_use]
    pub fn into_bootstrap(self) -> Option<(BootstrapOptions, Vec<String>)> {
        if self.command.is_empty() {
            return None;
        }
        let options = BootstrapOptions {
            user: self.user,
            gateway: self.gateway,
            workdir: self.workdir,
            env_file: self.env_file,
        };
        Some((options, self.command))
    }
}

/// Arguments of `berth run`. `-h` sets the hostname; help is `--help`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Print help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,

    /// Container hostname
    #[arg(short = 'h', long)]
    pub hostname: Option<String>,

    /// Working directory inside the container
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    /// Keep stdin open and attach it
    #[arg(short, long)]
    pub interactive: bool,

    /// Allocate a pseudo-TTY
    #[arg(short, long)]
    pub tty: bool,

    /// Run in the background and print the container ID
    #[arg(short, long)]
    pub detach: bool,

    /// Attach to STDIN, STDOUT or STDERR
    #[arg(short, long, value_name = "STREAM")]
    pub attach: Vec<String>,

    /// Bind mount a volume (SRC:DST[:ro])
    #[arg(short = 'v', long = "volume", value_name = "BIND")]
    pub volumes: Vec<String>,

    /// Set environment variables (KEY=VALUE)
    #[arg(short, long)]
    pub env: Vec<String>,

    /// User name or uid to run as
    #[arg(short, long)]
    pub user: Option<String>,

    /// Default gateway inside the container
    #[arg(long)]
    pub gateway: Option<String>,

    /// Write the container ID to this file
    #[arg(long)]
    pub cidfile: Option<PathBuf>,

    /// Remove the container when it exits
    #[arg(long)]
    pub rm: bool,

    /// Override the detach sequence, e.g. ctrl-p,ctrl-q
    #[arg(long)]
    pub detach_keys: Option<DetachKeys>,

    /// Image to record for the container
    pub image: String,

    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Translate the flags into a run request.
    ///
    /// # Errors
    ///
    /// Fails on a malformed bind mount or attach stream name.
    pub fn into_options(self) -> BerthResult<RunOptions> {
        let attach = if self.attach.is_empty() {
            AttachStreams::new(self.interactive)
        } else {
            AttachStreams::from_names(&self.attach)?
        };

        let config = ContainerConfig {
            image: self.image,
            cmd: self.command,
            env: self.env,
            user: self.user,
            workdir: self.workdir,
            hostname: self.hostname,
            gateway: self.gateway,
            tty: self.tty,
            open_stdin: self.interactive,
            auto_remove: self.rm,
            binds: parse_binds(&self.volumes)?,
            cidfile: self.cidfile,
        };

        Ok(RunOptions {
            config,
            detach: self.detach,
            attach,
            detach_keys: self.detach_keys,
        })
    }
}

/// Width of the `ps` COMMAND column, in characters.
const COMMAND_WIDTH: usize = 20;

/// `cmd` joined by spaces, cut to at most `max` characters ending in `…`.
fn ellipsize_command(cmd: &[String], max: usize) -> String {
    let joined = cmd.join(" ");
    if joined.chars().count() <= max {
        return joined;
    }
    let mut cut: String = joined.chars().take(max.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

fn format_age(record: &ContainerRecord) -> String {
    let age = chrono::Utc::now() - record.created;
    match (age.num_days(), age.num_hours(), age.num_minutes()) {
        (d, _, _) if d > 0 => format!("{d} days ago"),
        (_, h, _) if h > 0 => format!("{h} hours ago"),
        (_, _, m) if m > 0 => format!("{m} minutes ago"),
        _ => "Less than a minute ago".to_string(),
    }
}

impl Cli {
    fn runtime_config(&self) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        if let Some(root) = &self.root {
            config = config.with_root(root.clone());
        }
        match std::env::current_exe() {
            Ok(program) => config.with_supervisor(program),
            Err(e) => {
                tracing::warn!(error = %e, "Own binary not found, supervising in process");
                config
            }
        }
    }

    /// Execute the CLI command and return the process exit status.
    ///
    /// `init` never reaches this point; it runs before any async runtime exists.
    ///
    /// # Errors
    ///
    /// Returns any command failure for top-level reporting.
    pub async fn execute(self) -> Result<i32> {
        let config = self.runtime_config();
        if let Commands::Shim {
            container_id,
            attach_first,
        } = &self.command
        {
            shim::serve(config, container_id, *attach_first, std::io::stdout()).await?;
            return Ok(0);
        }
        let facade = CommandFacade::new(RuntimeMonitor::new(config));

        match self.command {
            Commands::Init(_) => Err(eyre!("berth init must run before the async runtime")),
            Commands::Shim { .. } => Ok(0),

            Commands::Run(args) => {
                let raw = args.tty && args.interactive && !args.detach;
                let options = (*args).into_options()?;

                let _terminal = if raw { RawTerminal::enable() } else { None };
                let outcome = facade.run(options, ClientStreams::stdio()).await?;

                Ok(match outcome.session {
                    Some(SessionEnd::ContainerExited) => outcome.exit_code.unwrap_or_default(),
                    _ => 0,
                })
            }

            Commands::Attach {
                container_id,
                detach_keys,
            } => {
                let tty = facade.inspect(&container_id).is_ok_and(|r| r.config.tty);
                let _terminal = if tty { RawTerminal::enable() } else { None };
                facade
                    .attach(&container_id, ClientStreams::stdio(), detach_keys)
                    .await?;
                Ok(0)
            }

            Commands::Wait { container_ids } => {
                for id in container_ids {
                    let code = facade.wait(&id).await?;
                    println!("{code}");
                }
                Ok(0)
            }

            Commands::Kill { container_ids } => {
                for id in container_ids {
                    facade
                        .kill(&id)
                        .await
                        .map_err(|e| eyre!("Failed to kill container {id}: {e}"))?;
                    println!("{id}");
                }
                Ok(0)
            }

            Commands::Rm { container_ids } => {
                for id in container_ids {
                    facade
                        .remove(&id)
                        .map_err(|e| eyre!("Failed to remove container {id}: {e}"))?;
                    println!("{id}");
                }
                Ok(0)
            }

            Commands::Ps { all, quiet, format } => {
                let records: Vec<ContainerRecord> = facade
                    .list()?
                    .into_iter()
                    .filter(|r| all || r.status.is_running())
                    .collect();

                if quiet {
                    for record in &records {
                        println!("{}", record.id.short());
                    }
                } else if format == "json" {
                    println!("{}", serde_json::to_string_pretty(&records)?);
                } else {
                    println!("CONTAINER ID\tIMAGE\tCOMMAND\tCREATED\tSTATUS");
                    for record in &records {
                        println!(
                            "{}\t{}\t{}\t{}\t{}",
                            record.id.short(),
                            record.config.image,
                            ellipsize_command(&record.config.cmd, COMMAND_WIDTH),
                            format_age(record),
                            record.status
                        );
                    }
                }
                Ok(0)
            }

            Commands::Logs {
                container_id,
                follow,
            } => {
                let mut printed = 0;
                loop {
                    let entries = facade.logs(&container_id)?;
                    for entry in entries.iter().skip(printed) {
                        if entry.stream == "stderr" {
                            eprint!("{}", entry.log);
                        } else {
                            print!("{}", entry.log);
                        }
                    }
                    printed = entries.len();

                    if !follow || facade.inspect(&container_id)?.status.is_finished() {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Ok(0)
            }
        }
    }
}
