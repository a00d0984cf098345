//! Container registry and lifecycle driver.
//!
//! The monitor is the only writer of container status. Each container has
//! its own lock and status channel, so operations on unrelated containers
//! never wait on each other. Exit of a process is observed by one
//! supervisor task per running container.

use std::collections::HashSet;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use berth_common::{BerthError, BerthResult, ContainerId};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::process::Child;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;

use super::config::RuntimeConfig;
use super::container::{ContainerConfig, ContainerRecord, ContainerStatus};
use super::events::{EventBus, RuntimeEvent};
use super::logs::JsonLogWriter;
use super::state::StateManager;
use crate::bootstrap::env::render_sentinel;
use crate::exec::{ContainerStreams, ProcessLauncher};

/// Exit code recorded when the exit status could not be collected.
const UNKNOWN_EXIT_CODE: i32 = -1;

/// A registered container.
struct Tracked {
    id: ContainerId,
    record: Mutex<ContainerRecord>,
    status: watch::Sender<ContainerStatus>,
    streams: ContainerStreams,
    exit_code: OnceLock<i32>,
    kill: Notify,
    /// Claimed by the one `start` allowed to spawn the process.
    starting: AtomicBool,
}

impl Tracked {
    fn new(record: ContainerRecord) -> Arc<Self> {
        let (status, _) = watch::channel(record.status);
        Arc::new(Self {
            id: record.id.clone(),
            streams: ContainerStreams::new(record.config.tty),
            record: Mutex::new(record),
            status,
            exit_code: OnceLock::new(),
            kill: Notify::new(),
            starting: AtomicBool::new(false),
        })
    }
}

struct Inner {
    config: RuntimeConfig,
    launcher: ProcessLauncher,
    registry: DashMap<ContainerId, Arc<Tracked>>,
    /// Every id handed out, including removed containers.
    issued: Mutex<HashSet<ContainerId>>,
    state: StateManager,
    events: EventBus,
}

/// Process-wide container registry. Cheap to clone.
#[derive(Clone)]
pub struct RuntimeMonitor {
    inner: Arc<Inner>,
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(UNKNOWN_EXIT_CODE)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn write_cidfile(path: &Path, id: &ContainerId) -> BerthResult<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => BerthError::Config {
                message: format!("cidfile {} already exists", path.display()),
            },
            _ => BerthError::Io(e),
        })?;
    file.write_all(id.as_str().as_bytes())?;
    Ok(())
}

impl RuntimeMonitor {
    /// Create a monitor with an empty registry.
    ///
    /// Ids of containers persisted under the same root count as issued.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let state = StateManager::new(config.paths.clone());
        let issued = match state.list() {
            Ok(records) => records.into_iter().map(|r| r.id).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read persisted containers");
                HashSet::new()
            }
        };

        Self {
            inner: Arc::new(Inner {
                launcher: ProcessLauncher::new(&config.init_path),
                state,
                config,
                registry: DashMap::new(),
                issued: Mutex::new(issued),
                events: EventBus::new(),
            }),
        }
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.inner.events.subscribe()
    }

    /// Register a new container in `Created` state.
    ///
    /// Stages the bootstrap environment and writes the cidfile, if any,
    /// before the container becomes visible.
    ///
    /// # Errors
    ///
    /// Fails on an empty command, an invalid bind mount, an existing cidfile
    /// or a filesystem error.
    pub fn create(&self, config: ContainerConfig) -> BerthResult<ContainerId> {
        if config.cmd.is_empty() {
            return Err(BerthError::Config {
                message: "no command specified".to_string(),
            });
        }
        for bind in &config.binds {
            bind.validate()?;
        }
        self.inner.config.paths.ensure_dirs()?;

        let id = self.allocate_id();
        let tracked = self.prepare(id.clone(), config)?;
        self.inner.registry.insert(id.clone(), tracked);

        self.inner.events.publish(RuntimeEvent::ContainerCreated {
            id: id.to_string(),
            timestamp: now(),
        });
        tracing::info!(container_id = %id, "Container created");
        Ok(id)
    }

    /// A fresh id whose short form was never issued before.
    fn allocate_id(&self) -> ContainerId {
        let mut issued = self.inner.issued.lock();
        loop {
            let id = ContainerId::generate();
            if !issued.iter().any(|other| other.short() == id.short()) {
                issued.insert(id.clone());
                return id;
            }
        }
    }

    fn prepare(&self, id: ContainerId, config: ContainerConfig) -> BerthResult<Arc<Tracked>> {
        let paths = &self.inner.config.paths;
        let dir = paths.container(id.as_str());
        std::fs::create_dir_all(&dir)?;

        let staged = (|| {
            std::fs::write(
                paths.container_env(id.as_str()),
                render_sentinel(&config.environment())?,
            )?;
            if let Some(cidfile) = &config.cidfile {
                write_cidfile(cidfile, &id)?;
            }
            let record = ContainerRecord::new(id.clone(), config);
            self.inner.state.save(&record)?;
            Ok::<_, BerthError>(record)
        })();

        let record = match staged {
            Ok(record) => record,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(e);
            }
        };

        Ok(Tracked::new(record))
    }

    /// Give up a `Created` container so that another process can supervise it.
    ///
    /// The container stays on disk and its id stays issued.
    ///
    /// # Errors
    ///
    /// Fails unless the container is `Created` and not being started.
    pub fn release(&self, id_or_prefix: &str) -> BerthResult<ContainerRecord> {
        let entry = self.lookup(id_or_prefix)?;
        let record = entry.record.lock();
        if record.status != ContainerStatus::Created || entry.starting.swap(true, Ordering::AcqRel) {
            return Err(BerthError::InvalidState {
                id: entry.id.to_string(),
                status: record.status.to_string(),
                operation: "hand off".to_string(),
            });
        }

        self.inner.registry.remove(&entry.id);
        tracing::debug!(container_id = %entry.id, "Container released");
        Ok(record.clone())
    }

    /// Take over a persisted `Created` container, typically one released by
    /// another process.
    ///
    /// # Errors
    ///
    /// Fails if there is no such persisted container or it is past `Created`.
    pub fn adopt(&self, id: &str) -> BerthResult<ContainerId> {
        let record = self.inner.state.load(id)?;
        if record.status != ContainerStatus::Created {
            return Err(BerthError::InvalidState {
                id: record.id.to_string(),
                status: record.status.to_string(),
                operation: "adopt".to_string(),
            });
        }

        let id = record.id.clone();
        self.inner.issued.lock().insert(id.clone());
        self.inner.registry.insert(id.clone(), Tracked::new(record));
        tracing::debug!(container_id = %id, "Container adopted");
        Ok(id)
    }

    /// Find a container by full id or unambiguous prefix.
    fn lookup(&self, id_or_prefix: &str) -> BerthResult<Arc<Tracked>> {
        if let Ok(id) = ContainerId::new(id_or_prefix) {
            if let Some(entry) = self.inner.registry.get(&id) {
                return Ok(Arc::clone(entry.value()));
            }
        }

        let mut matches: Vec<Arc<Tracked>> = if id_or_prefix.is_empty() {
            Vec::new()
        } else {
            self.inner
                .registry
                .iter()
                .filter(|entry| entry.key().as_str().starts_with(id_or_prefix))
                .map(|entry| Arc::clone(entry.value()))
                .collect()
        };

        match matches.len() {
            0 => Err(BerthError::ContainerNotFound {
                id: id_or_prefix.to_string(),
            }),
            1 => Ok(matches.remove(0)),
            n => Err(BerthError::AmbiguousId {
                prefix: id_or_prefix.to_string(),
                matches: n,
            }),
        }
    }

    /// Full id of a container.
    ///
    /// # Errors
    ///
    /// Returns not-found or ambiguous-prefix errors.
    pub fn resolve(&self, id_or_prefix: &str) -> BerthResult<ContainerId> {
        Ok(self.lookup(id_or_prefix)?.id.clone())
    }

    /// Snapshot of one container.
    ///
    /// # Errors
    ///
    /// Returns not-found or ambiguous-prefix errors.
    pub fn inspect(&self, id_or_prefix: &str) -> BerthResult<ContainerRecord> {
        Ok(self.lookup(id_or_prefix)?.record.lock().clone())
    }

    /// The container's stream triple.
    ///
    /// # Errors
    ///
    /// Returns not-found or ambiguous-prefix errors.
    pub fn streams(&self, id_or_prefix: &str) -> BerthResult<ContainerStreams> {
        Ok(self.lookup(id_or_prefix)?.streams.clone())
    }

    /// Point-in-time snapshot of every registered container, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<ContainerRecord> {
        let mut records: Vec<ContainerRecord> = self
            .inner
            .registry
            .iter()
            .map(|entry| entry.record.lock().clone())
            .collect();
        records.sort_by(|a, b| b.created.cmp(&a.created));
        records
    }

    /// Move a container to `next` under its lock and persist the result.
    fn transition(
        &self,
        entry: &Tracked,
        next: ContainerStatus,
        operation: &str,
        update: impl FnOnce(&mut ContainerRecord),
    ) -> BerthResult<()> {
        let mut record = entry.record.lock();
        if !record.status.can_transition_to(&next) {
            return Err(BerthError::InvalidState {
                id: entry.id.to_string(),
                status: record.status.to_string(),
                operation: operation.to_string(),
            });
        }

        update(&mut record);
        record.apply(next);
        entry.status.send_replace(next);

        if next != ContainerStatus::Removed {
            if let Err(e) = self.inner.state.save(&record) {
                tracing::warn!(container_id = %entry.id, error = %e, "Failed to persist state");
            }
        }
        Ok(())
    }

    /// Launch the process of a `Created` container.
    ///
    /// # Errors
    ///
    /// Fails if the container is not `Created` or the process cannot be spawned.
    pub async fn start(&self, id_or_prefix: &str) -> BerthResult<()> {
        let entry = self.lookup(id_or_prefix)?;
        let id = entry.id.as_str();

        let config = {
            let record = entry.record.lock();
            if record.status != ContainerStatus::Created {
                return Err(BerthError::InvalidState {
                    id: id.to_string(),
                    status: record.status.to_string(),
                    operation: "start".to_string(),
                });
            }
            if entry.starting.swap(true, Ordering::AcqRel) {
                return Err(BerthError::InvalidState {
                    id: id.to_string(),
                    status: "starting".to_string(),
                    operation: "start".to_string(),
                });
            }
            record.config.clone()
        };

        let paths = &self.inner.config.paths;
        let log = match JsonLogWriter::open(paths.container_log(id)) {
            Ok(log) => Some(log),
            Err(e) => {
                tracing::warn!(container_id = %id, error = %e, "Container log unavailable");
                None
            }
        };

        let mut launched = match self.inner.launcher.launch(
            &config,
            &paths.container_env(id),
            &entry.streams,
            log,
        ) {
            Ok(launched) => launched,
            Err(e) => {
                entry.starting.store(false, Ordering::Release);
                return Err(e);
            }
        };
        if let Some(stdin) = launched.stdin.take() {
            entry.streams.stdin.attach(stdin).await;
        }
        let pid = launched.pid().unwrap_or_default();

        if let Err(e) = self.transition(&entry, ContainerStatus::Running, "start", |r| {
            r.pid = Some(pid);
        }) {
            // An unrecorded process must not keep running.
            let _ = launched.child.start_kill();
            return Err(e);
        }

        self.inner.events.publish(RuntimeEvent::ContainerStarted {
            id: id.to_string(),
            pid,
            timestamp: now(),
        });
        tracing::info!(container_id = %id, pid, "Container started");

        tokio::spawn(
            self.clone()
                .supervise(Arc::clone(&entry), launched.child, launched.pumps),
        );
        Ok(())
    }

    /// Wait for the process, drain output, record the exit.
    async fn supervise(self, entry: Arc<Tracked>, mut child: Child, mut pumps: Vec<JoinHandle<()>>) {
        let status = tokio::select! {
            status = child.wait() => status,
            () = entry.kill.notified() => {
                tracing::debug!(container_id = %entry.id, "Killing container process");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(container_id = %entry.id, error = %e, "Kill failed");
                }
                child.wait().await
            }
        };

        let exit_code = match status {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                tracing::warn!(container_id = %entry.id, error = %e, "Failed to collect exit status");
                UNKNOWN_EXIT_CODE
            }
        };

        // Descendants may keep the output open after the process is gone.
        let drained = tokio::time::timeout(
            self.inner.config.drain_timeout,
            futures::future::join_all(pumps.iter_mut()),
        )
        .await
        .is_ok();
        if !drained {
            tracing::warn!(container_id = %entry.id, "Output still open after exit, closing");
            pumps.iter().for_each(JoinHandle::abort);
        }
        entry.streams.close().await;

        let _ = entry.exit_code.set(exit_code);
        if let Err(e) = self.transition(&entry, ContainerStatus::Exited { exit_code }, "exit", |_| {}) {
            tracing::error!(container_id = %entry.id, error = %e, "Exit not recorded");
            return;
        }

        self.inner.events.publish(RuntimeEvent::ContainerExited {
            id: entry.id.to_string(),
            exit_code,
            timestamp: now(),
        });
        tracing::info!(container_id = %entry.id, exit_code, "Container exited");

        let auto_remove = entry.record.lock().config.auto_remove;
        if auto_remove {
            if let Err(e) = self.remove(entry.id.as_str()) {
                tracing::warn!(container_id = %entry.id, error = %e, "Auto-remove failed");
            }
        }
    }

    async fn wait_tracked(entry: &Tracked, timeout: Option<Duration>) -> BerthResult<i32> {
        let mut rx = entry.status.subscribe();
        let finished = async move {
            rx.wait_for(ContainerStatus::is_finished)
                .await
                .map(|status| *status)
        };

        let status = match timeout {
            Some(limit) => tokio::time::timeout(limit, finished).await.map_err(|_| {
                BerthError::WaitTimeout {
                    id: entry.id.to_string(),
                    timeout_ms: limit.as_millis(),
                }
            })?,
            None => finished.await,
        }
        .map_err(|e| BerthError::Internal {
            message: format!("status channel closed: {e}"),
        })?;

        Ok(status
            .exit_code()
            .or_else(|| entry.exit_code.get().copied())
            .unwrap_or(UNKNOWN_EXIT_CODE))
    }

    /// Block until the container has exited and return its exit code.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::WaitTimeout`] if `timeout` elapses first.
    pub async fn wait(&self, id_or_prefix: &str, timeout: Option<Duration>) -> BerthResult<i32> {
        self.waiter(id_or_prefix, timeout)?.await
    }

    /// Resolve the container now and wait for its exit later.
    ///
    /// The returned future still yields the exit code after the container
    /// has been removed.
    ///
    /// # Errors
    ///
    /// Returns not-found or ambiguous-prefix errors immediately.
    pub fn waiter(
        &self,
        id_or_prefix: &str,
        timeout: Option<Duration>,
    ) -> BerthResult<impl Future<Output = BerthResult<i32>> + Send + 'static> {
        let entry = self.lookup(id_or_prefix)?;
        Ok(async move { Self::wait_tracked(&entry, timeout).await })
    }

    /// Terminate the container's process and wait until it is gone.
    /// A no-op on an exited container.
    ///
    /// # Errors
    ///
    /// Fails for a container that was never started.
    pub async fn kill(&self, id_or_prefix: &str) -> BerthResult<()> {
        let entry = self.lookup(id_or_prefix)?;
        let status = *entry.status.borrow();

        match status {
            ContainerStatus::Created => Err(BerthError::InvalidState {
                id: entry.id.to_string(),
                status: status.to_string(),
                operation: "kill".to_string(),
            }),
            ContainerStatus::Exited { .. } | ContainerStatus::Removed => Ok(()),
            ContainerStatus::Running => {
                entry.kill.notify_one();
                Self::wait_tracked(&entry, None).await.map(|_| ())
            }
        }
    }

    /// Delete an exited container from the registry and disk.
    ///
    /// # Errors
    ///
    /// Fails unless the container has exited.
    pub fn remove(&self, id_or_prefix: &str) -> BerthResult<()> {
        let entry = self.lookup(id_or_prefix)?;
        self.transition(&entry, ContainerStatus::Removed, "remove", |_| {})?;

        self.inner.registry.remove(&entry.id);
        self.inner.state.delete(entry.id.as_str())?;

        self.inner.events.publish(RuntimeEvent::ContainerRemoved {
            id: entry.id.to_string(),
            timestamp: now(),
        });
        tracing::info!(container_id = %entry.id, "Container removed");
        Ok(())
    }
}
