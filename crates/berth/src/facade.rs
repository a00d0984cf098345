//! Client-level commands on top of the monitor.
//!
//! [`CommandFacade`] is what the CLI talks to: it turns `run`, `attach`,
//! `wait` and `logs` requests into monitor calls and attach sessions.

use std::path::Path;
use std::time::{Duration, Instant};

use berth_common::{BerthError, BerthResult, ContainerId};
use rustix::process::{Pid, Signal};
use tokio::io::AsyncWriteExt;

use crate::attach::{DetachKeys, SessionEnd, SessionOptions, StreamSession};
use crate::exec::ClientStreams;
use crate::runtime::{
    ContainerConfig, ContainerRecord, ContainerStatus, LogEntry, RuntimeMonitor, StateManager,
    read_log,
};
use crate::shim::{self, Hello};

/// Poll interval for containers owned by another berth process.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exit code reported when the exit happened out of sight.
const UNKNOWN_EXIT_CODE: i32 = -1;

/// Whether `pid` names a live process.
fn pid_alive(pid: u32) -> bool {
    i32::try_from(pid)
        .ok()
        .and_then(Pid::from_raw)
        .is_some_and(|pid| {
            matches!(
                rustix::process::test_kill_process(pid),
                Ok(()) | Err(rustix::io::Errno::PERM)
            )
        })
}

/// A persisted record says `Running` but its process is gone: the process
/// that owned it exited before recording the exit.
fn is_stale(record: &ContainerRecord) -> bool {
    record.status.is_running() && !record.pid.is_some_and(pid_alive)
}

fn reconcile(mut record: ContainerRecord) -> ContainerRecord {
    if is_stale(&record) {
        record.apply(ContainerStatus::Exited {
            exit_code: UNKNOWN_EXIT_CODE,
        });
    }
    record
}

async fn print_id(client: &mut ClientStreams, id: &ContainerId) -> BerthResult<()> {
    if let Some(stdout) = client.stdout.as_mut() {
        stdout.write_all(format!("{id}\n").as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Which client streams take part in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachStreams {
    /// Forward client input.
    pub stdin: bool,
    /// Forward container stdout.
    pub stdout: bool,
    /// Forward container stderr.
    pub stderr: bool,
}

impl AttachStreams {
    /// Output only, plus input when `interactive`.
    #[must_use]
    pub const fn new(interactive: bool) -> Self {
        Self {
            stdin: interactive,
            stdout: true,
            stderr: true,
        }
    }

    /// Exactly the named streams (`stdin`, `stdout`, `stderr`).
    ///
    /// # Errors
    ///
    /// Rejects any other name.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> BerthResult<Self> {
        let mut streams = Self {
            stdin: false,
            stdout: false,
            stderr: false,
        };
        for name in names {
            match name.as_ref() {
                "stdin" => streams.stdin = true,
                "stdout" => streams.stdout = true,
                "stderr" => streams.stderr = true,
                other => {
                    return Err(BerthError::Config {
                        message: format!("cannot attach to {other}: expected stdin, stdout or stderr"),
                    });
                }
            }
        }
        Ok(streams)
    }

    const fn any_output(self) -> bool {
        self.stdout || self.stderr
    }
}

impl Default for AttachStreams {
    fn default() -> Self {
        Self::new(false)
    }
}

/// A `run` request.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Container to create.
    pub config: ContainerConfig,
    /// Start in the background and return at once.
    pub detach: bool,
    /// Streams to attach in the foreground.
    pub attach: AttachStreams,
    /// Overrides the runtime's default detach sequence.
    pub detach_keys: Option<DetachKeys>,
}

impl RunOptions {
    /// Foreground run of `config`, attached as its stdin setting implies.
    #[must_use]
    pub fn new(config: ContainerConfig) -> Self {
        let attach = AttachStreams::new(config.open_stdin);
        Self {
            config,
            detach: false,
            attach,
            detach_keys: None,
        }
    }
}

/// What a `run` ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Full id of the new container.
    pub id: ContainerId,
    /// How the foreground session ended. `None` when detached up front.
    pub session: Option<SessionEnd>,
    /// Exit code, when the run lasted until the container exited.
    pub exit_code: Option<i32>,
}

/// Entry point for client commands.
#[derive(Clone)]
pub struct CommandFacade {
    monitor: RuntimeMonitor,
}

impl CommandFacade {
    /// Facade over `monitor`.
    #[must_use]
    pub const fn new(monitor: RuntimeMonitor) -> Self {
        Self { monitor }
    }

    /// The underlying monitor.
    #[must_use]
    pub const fn monitor(&self) -> &RuntimeMonitor {
        &self.monitor
    }

    fn session_options(&self, keys: Option<DetachKeys>, stdin_once: bool) -> SessionOptions {
        SessionOptions {
            detach_keys: keys.unwrap_or_else(|| self.monitor.config().detach_keys.clone()),
            stdin_once,
        }
    }

    /// Create and start a container, then attach to it unless detached.
    ///
    /// The full id is written to the client's stdout when detaching, or when
    /// no output stream is attached. With a supervisor configured the
    /// container is handed to a shim and the session runs over its socket.
    ///
    /// # Errors
    ///
    /// Fails on invalid options, a create or start failure, or a stream error.
    pub async fn run(&self, options: RunOptions, client: ClientStreams) -> BerthResult<RunOutcome> {
        let RunOptions {
            config,
            detach,
            attach,
            detach_keys,
        } = options;

        if detach && config.auto_remove {
            return Err(BerthError::Config {
                message: "conflicting options: --rm and -d".to_string(),
            });
        }

        let open_stdin = config.open_stdin;
        let id = self.monitor.create(config)?;
        let mut client = client;

        if let Some(program) = self.monitor.config().supervisor.clone() {
            let hello = Hello {
                stdin: attach.stdin,
                stdout: attach.stdout,
                stderr: attach.stderr,
                stdin_once: open_stdin && attach.stdin,
                detach_keys: detach_keys.map(|keys| keys.to_string()),
            };
            let request = (!detach).then_some(hello);
            return self.run_supervised(&program, id, request, client).await;
        }

        if detach {
            self.monitor.start(id.as_str()).await?;
            print_id(&mut client, &id).await?;
            return Ok(RunOutcome {
                id,
                session: None,
                exit_code: None,
            });
        }

        // Bound before start: output is not missed and exit is observable
        // even once auto-remove has dropped the container.
        let streams = self.monitor.streams(id.as_str())?;
        let session = StreamSession::new(
            &streams,
            self.session_options(detach_keys, open_stdin && attach.stdin),
        );
        let exited = self.monitor.waiter(id.as_str(), None)?;

        if !attach.any_output() {
            print_id(&mut client, &id).await?;
        }

        self.monitor.start(id.as_str()).await?;

        let client = client.select(attach.stdin, attach.stdout, attach.stderr);
        let end = session.run(client).await?;
        tracing::debug!(container_id = %id, ?end, "Foreground session ended");

        let exit_code = match end {
            SessionEnd::ContainerExited => Some(exited.await?),
            SessionEnd::Detached | SessionEnd::ClientDisconnected => None,
        };

        Ok(RunOutcome {
            id,
            session: Some(end),
            exit_code,
        })
    }

    /// Hand a created container to a shim, then attach through it unless
    /// `request` is `None`.
    async fn run_supervised(
        &self,
        program: &Path,
        id: ContainerId,
        request: Option<Hello>,
        mut client: ClientStreams,
    ) -> BerthResult<RunOutcome> {
        self.monitor.release(id.as_str())?;
        let paths = &self.monitor.config().paths;
        shim::spawn(program, paths, &id, request.is_some()).await?;

        let Some(hello) = request else {
            print_id(&mut client, &id).await?;
            return Ok(RunOutcome {
                id,
                session: None,
                exit_code: None,
            });
        };

        if !(hello.stdout || hello.stderr) {
            print_id(&mut client, &id).await?;
        }
        let client = client.select(hello.stdin, hello.stdout, hello.stderr);
        let summary = shim::attach(&paths.container_socket(id.as_str()), hello, client).await?;
        tracing::debug!(container_id = %id, end = ?summary.end, "Foreground session ended");

        Ok(RunOutcome {
            id,
            session: Some(summary.end),
            exit_code: summary.exit_code,
        })
    }

    /// Attach a new session to a running container.
    ///
    /// Ending the session never closes the container's stdin.
    ///
    /// # Errors
    ///
    /// Fails if the container is unknown or not running, or on a stream error.
    pub async fn attach(
        &self,
        id_or_prefix: &str,
        client: ClientStreams,
        detach_keys: Option<DetachKeys>,
    ) -> BerthResult<SessionEnd> {
        let (record, owned) = match self.monitor.inspect(id_or_prefix) {
            Err(BerthError::ContainerNotFound { .. }) => {
                (reconcile(self.state().resolve(id_or_prefix)?), false)
            }
            other => (other?, true),
        };
        if record.status != ContainerStatus::Running {
            return Err(BerthError::InvalidState {
                id: record.id.to_string(),
                status: record.status.to_string(),
                operation: "attach to".to_string(),
            });
        }

        if !owned {
            let socket = self.monitor.config().paths.container_socket(record.id.as_str());
            if !socket.exists() {
                return Err(BerthError::Config {
                    message: format!(
                        "container {} is owned by another berth process; its streams are not reachable from here",
                        record.id.short()
                    ),
                });
            }
            let hello = Hello {
                stdin: record.config.open_stdin,
                stdout: true,
                stderr: true,
                stdin_once: false,
                detach_keys: detach_keys.map(|keys| keys.to_string()),
            };
            let client = client.select(hello.stdin, true, true);
            tracing::info!(container_id = %record.id, "Attaching through the shim");
            return Ok(shim::attach(&socket, hello, client).await?.end);
        }

        let streams = self.monitor.streams(record.id.as_str())?;
        let client = client.select(record.config.open_stdin, true, true);
        tracing::info!(container_id = %record.id, "Attaching");
        StreamSession::new(&streams, self.session_options(detach_keys, false))
            .run(client)
            .await
    }

    /// Block until the container exits and return its exit code.
    ///
    /// # Errors
    ///
    /// Fails if the container is unknown.
    pub async fn wait(&self, id_or_prefix: &str) -> BerthResult<i32> {
        match self.monitor.wait(id_or_prefix, None).await {
            Err(BerthError::ContainerNotFound { .. }) => self.wait_persisted(id_or_prefix).await,
            other => other,
        }
    }

    /// How long a persisted `Running` record may outlive its process before
    /// the exit counts as lost. The owner needs up to a drain timeout to
    /// record it.
    fn stale_grace(&self) -> Duration {
        self.monitor.config().drain_timeout + 10 * POLL_INTERVAL
    }

    async fn wait_persisted(&self, id_or_prefix: &str) -> BerthResult<i32> {
        let state = self.state();
        let id = state.resolve(id_or_prefix)?.id;
        let mut stale_since: Option<Instant> = None;

        loop {
            let record = state.load(id.as_str())?;
            match record.status {
                ContainerStatus::Exited { exit_code } => return Ok(exit_code),
                ContainerStatus::Removed => return Ok(UNKNOWN_EXIT_CODE),
                _ if is_stale(&record) => {
                    let since = *stale_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > self.stale_grace() {
                        return Ok(UNKNOWN_EXIT_CODE);
                    }
                }
                _ => stale_since = None,
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Terminate a container and wait until its process is gone.
    ///
    /// # Errors
    ///
    /// Fails if the container is unknown or was never started.
    pub async fn kill(&self, id_or_prefix: &str) -> BerthResult<()> {
        match self.monitor.kill(id_or_prefix).await {
            Err(BerthError::ContainerNotFound { .. }) => self.kill_persisted(id_or_prefix).await,
            other => other,
        }
    }

    async fn kill_persisted(&self, id_or_prefix: &str) -> BerthResult<()> {
        let state = self.state();
        let record = state.resolve(id_or_prefix)?;

        match record.status {
            ContainerStatus::Created => {
                return Err(BerthError::InvalidState {
                    id: record.id.to_string(),
                    status: record.status.to_string(),
                    operation: "kill".to_string(),
                });
            }
            ContainerStatus::Exited { .. } | ContainerStatus::Removed => return Ok(()),
            ContainerStatus::Running => {}
        }

        if let Some(pid) = record.pid.filter(|&pid| pid_alive(pid)) {
            if let Some(target) = i32::try_from(pid).ok().and_then(Pid::from_raw) {
                tracing::debug!(container_id = %record.id, pid, "Killing persisted container");
                rustix::process::kill_process(target, Signal::KILL)
                    .map_err(|e| BerthError::Io(e.into()))?;
            }
            while pid_alive(pid) {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        // The owning process, if alive, records the real exit itself and
        // may remove the container.
        if let Err(e) = self.wait_persisted(record.id.as_str()).await {
            return match e {
                BerthError::ContainerNotFound { .. } => Ok(()),
                other => Err(other),
            };
        }
        let mut record = match state.load(record.id.as_str()) {
            Err(BerthError::ContainerNotFound { .. }) => return Ok(()),
            other => other?,
        };
        if record.status.is_running() {
            record.apply(ContainerStatus::Exited { exit_code: 128 + 9 });
            state.save(&record)?;
        }
        Ok(())
    }

    /// Delete an exited container.
    ///
    /// # Errors
    ///
    /// Fails if the container is unknown or still running.
    pub fn remove(&self, id_or_prefix: &str) -> BerthResult<()> {
        match self.monitor.remove(id_or_prefix) {
            Err(BerthError::ContainerNotFound { .. }) => {
                let state = self.state();
                let record = reconcile(state.resolve(id_or_prefix)?);
                if !record.status.is_finished() {
                    return Err(BerthError::InvalidState {
                        id: record.id.to_string(),
                        status: record.status.to_string(),
                        operation: "remove".to_string(),
                    });
                }
                state.delete(record.id.as_str())?;
                tracing::info!(container_id = %record.id, "Container removed");
                Ok(())
            }
            other => other,
        }
    }

    fn state(&self) -> StateManager {
        StateManager::new(self.monitor.config().paths.clone())
    }

    /// Look a container up among live ones first, then persisted state.
    ///
    /// # Errors
    ///
    /// Returns not-found or ambiguous-prefix errors.
    pub fn inspect(&self, id_or_prefix: &str) -> BerthResult<ContainerRecord> {
        match self.monitor.inspect(id_or_prefix) {
            Err(BerthError::ContainerNotFound { .. }) => {
                self.state().resolve(id_or_prefix).map(reconcile)
            }
            other => other,
        }
    }

    /// Captured output of a container, in order.
    ///
    /// # Errors
    ///
    /// Fails if the container is unknown or its log is unreadable.
    pub fn logs(&self, id_or_prefix: &str) -> BerthResult<Vec<LogEntry>> {
        let record = self.inspect(id_or_prefix)?;
        read_log(&self.monitor.config().paths.container_log(record.id.as_str()))
    }

    /// Every container known to this monitor or persisted on disk, newest first.
    ///
    /// # Errors
    ///
    /// Fails if persisted state cannot be listed.
    pub fn list(&self) -> BerthResult<Vec<ContainerRecord>> {
        let mut records = self.monitor.list();
        for record in self.state().list()? {
            if !records.iter().any(|live| live.id == record.id) {
                records.push(reconcile(record));
            }
        }
        records.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_stream_names() {
        let streams = AttachStreams::from_names(&["stdin", "stderr"]).unwrap();
        assert!(streams.stdin && streams.stderr && !streams.stdout);
        assert!(!AttachStreams::from_names::<&str>(&[]).unwrap().any_output());
        assert!(AttachStreams::from_names(&["tty"]).is_err());
    }

    #[test]
    fn interactive_runs_attach_stdin() {
        let mut config = ContainerConfig::new("base", vec!["cat".into()]);
        config.open_stdin = true;
        let options = RunOptions::new(config);
        assert_eq!(options.attach, AttachStreams::new(true));
        assert!(!options.detach);
    }
}
