//! Process spawning.
//!
//! A container process is the berth binary itself, re-executed as
//! `berth init`, which bootstraps the environment and execs the requested
//! program. The launcher only wires up stdio and the isolation hooks that
//! must run before that bootstrap.

#![allow(unsafe_code)]

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use berth_common::{BerthError, BerthResult};
use caps::{CapSet, Capability};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::pty::{PtyPair, set_controlling_terminal};
use super::stdio::{BoxedWriter, ContainerStreams, pump_output};
use crate::runtime::ContainerConfig;
use crate::runtime::logs::JsonLogWriter;

/// A spawned container process.
pub struct LaunchedProcess {
    /// The bootstrap process, later the container program.
    pub child: Child,
    /// Write end of the process's stdin, when stdin is open.
    pub stdin: Option<BoxedWriter>,
    /// Output pumps. They finish once the process side closes its output.
    pub pumps: Vec<JoinHandle<()>>,
}

impl LaunchedProcess {
    /// Process id.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Spawns container processes through the bootstrap entry point.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    init_path: PathBuf,
}

impl ProcessLauncher {
    /// Launcher re-executing `init_path`.
    pub fn new(init_path: impl Into<PathBuf>) -> Self {
        Self {
            init_path: init_path.into(),
        }
    }

    /// Arguments for `berth init`.
    #[must_use]
    pub fn bootstrap_args(config: &ContainerConfig, env_file: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["init".into()];
        if let Some(user) = &config.user {
            args.extend(["-u".into(), user.into()]);
        }
        if let Some(gateway) = &config.gateway {
            args.extend(["-g".into(), gateway.into()]);
        }
        if let Some(workdir) = &config.workdir {
            args.extend(["-w".into(), workdir.into()]);
        }
        args.extend(["--env-file".into(), env_file.into()]);
        args.push("--".into());
        args.extend(config.cmd.iter().map(OsString::from));
        args
    }

    /// Spawn the process for `config` and start pumping its output into `streams`.
    ///
    /// # Errors
    ///
    /// Returns an error if stdio cannot be set up or the spawn fails.
    pub fn launch(
        &self,
        config: &ContainerConfig,
        env_file: &Path,
        streams: &ContainerStreams,
        log: Option<JsonLogWriter>,
    ) -> BerthResult<LaunchedProcess> {
        let mut cmd = Command::new(&self.init_path);
        cmd.args(Self::bootstrap_args(config, env_file))
            .env_clear()
            .kill_on_drop(false);

        if let Some(hostname) = config.hostname.clone() {
            ensure_sys_admin("setting a hostname")?;
            // SAFETY: the hook runs between fork and exec and only issues syscalls.
            unsafe {
                cmd.pre_exec(move || enter_uts_namespace(&hostname));
            }
        }

        tracing::debug!(
            init = %self.init_path.display(),
            command = ?config.cmd,
            tty = config.tty,
            "Spawning container process"
        );

        if config.tty {
            Self::launch_tty(cmd, config, streams, log)
        } else {
            Self::launch_piped(cmd, config, streams, log)
        }
    }

    fn launch_piped(
        mut cmd: Command,
        config: &ContainerConfig,
        streams: &ContainerStreams,
        log: Option<JsonLogWriter>,
    ) -> BerthResult<LaunchedProcess> {
        let stdin = if config.open_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        cmd.stdin(stdin).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| spawn_error(&cmd, e))?;

        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        let stdin = child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as BoxedWriter);

        let pumps = vec![
            tokio::spawn(pump_output(stdout, streams.stdout.clone(), log.clone())),
            tokio::spawn(pump_output(stderr, streams.stderr.clone(), log)),
        ];

        Ok(LaunchedProcess { child, stdin, pumps })
    }

    fn launch_tty(
        mut cmd: Command,
        config: &ContainerConfig,
        streams: &ContainerStreams,
        log: Option<JsonLogWriter>,
    ) -> BerthResult<LaunchedProcess> {
        let mut pty = PtyPair::open()?;
        cmd.stdin(pty.slave_stdio()?)
            .stdout(pty.slave_stdio()?)
            .stderr(pty.slave_stdio()?);

        // SAFETY: the hook runs between fork and exec and only issues syscalls.
        unsafe {
            cmd.pre_exec(set_controlling_terminal);
        }

        let child = cmd.spawn().map_err(|e| spawn_error(&cmd, e))?;
        // The command still owns slave copies; both must go for EOF to reach the master.
        drop(cmd);
        pty.close_slave();

        let (reader, writer) = pty.into_master()?;
        let stdin = config
            .open_stdin
            .then(|| Box::new(writer) as BoxedWriter);

        // A terminal merges both outputs.
        streams.stderr.close();
        let pumps = vec![tokio::spawn(pump_output(reader, streams.stdout.clone(), log))];

        Ok(LaunchedProcess { child, stdin, pumps })
    }
}

fn spawn_error(cmd: &Command, err: std::io::Error) -> BerthError {
    BerthError::Internal {
        message: format!(
            "failed to spawn {}: {err}",
            cmd.as_std().get_program().to_string_lossy()
        ),
    }
}

fn missing_pipe(name: &str) -> BerthError {
    BerthError::Internal {
        message: format!("child {name} pipe missing"),
    }
}

/// Fail early, with a readable error, when namespaces cannot be created.
fn ensure_sys_admin(purpose: &str) -> BerthResult<()> {
    let permitted = caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_ADMIN)
        .map_err(|e| BerthError::Internal {
            message: format!("failed to read capabilities: {e}"),
        })?;
    if permitted {
        Ok(())
    } else {
        Err(BerthError::Config {
            message: format!("{purpose} requires CAP_SYS_ADMIN"),
        })
    }
}

/// Give the child its own UTS namespace and hostname.
fn enter_uts_namespace(hostname: &str) -> std::io::Result<()> {
    // SAFETY: called in the single-threaded child between fork and exec.
    unsafe { rustix::thread::unshare_unsafe(rustix::thread::UnshareFlags::NEWUTS)? };
    rustix::system::sethostname(hostname.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_args_carry_options_before_the_separator() {
        let mut config = ContainerConfig::new("base", vec!["ls".into(), "-l".into()]);
        config.user = Some("daemon".into());
        config.workdir = Some(PathBuf::from("/tmp"));

        let args = ProcessLauncher::bootstrap_args(&config, Path::new("/run/c/config.env"));
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(
            args,
            vec![
                "init",
                "-u",
                "daemon",
                "-w",
                "/tmp",
                "--env-file",
                "/run/c/config.env",
                "--",
                "ls",
                "-l"
            ]
        );
    }

    #[test]
    fn dash_prefixed_commands_stay_after_the_separator() {
        let config = ContainerConfig::new("base", vec!["-h".into()]);
        let args = ProcessLauncher::bootstrap_args(&config, Path::new("/env"));
        assert_eq!(args[args.len() - 2], OsString::from("--"));
        assert_eq!(args[args.len() - 1], OsString::from("-h"));
    }
}
