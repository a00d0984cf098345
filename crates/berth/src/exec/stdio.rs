//! Container-side standard streams.
//!
//! Each output stream of a container is pumped into an [`OutputHub`]: chunks
//! are appended to the container log and queued for every attached session.
//! Input goes through a shared [`ContainerStdin`] handle that is closed exactly
//! once, either by a `stdin_once` session or when the process exits.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::runtime::logs::JsonLogWriter;

/// Boxed async reader.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed async writer.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Chunks queued per subscriber before publishing waits.
pub const SUBSCRIBER_CAPACITY: usize = 64;
const READ_BUF_SIZE: usize = 32 * 1024;
/// Longest log record. Longer lines are split into several records.
const MAX_LOG_LINE: usize = 16 * 1024;

/// An output stream of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Standard output (and the terminal in TTY mode).
    Stdout,
    /// Standard error.
    Stderr,
}

impl StreamKind {
    /// Name used in log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct HubState {
    open: bool,
    subscribers: Vec<mpsc::Sender<Bytes>>,
}

/// Fan-out point for one container output stream.
///
/// Every subscriber has a bounded queue. Publishing waits for room in each
/// of them, so a slow session slows the container's output down instead of
/// losing it. A dropped receiver unsubscribes.
#[derive(Clone)]
pub struct OutputHub {
    kind: StreamKind,
    state: Arc<Mutex<HubState>>,
}

impl OutputHub {
    /// Create an open hub.
    #[must_use]
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(HubState {
                open: true,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Which stream this hub carries.
    #[must_use]
    pub const fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Receive every chunk published from now on. `None` once the hub is closed.
    #[must_use]
    pub fn subscribe(&self) -> Option<mpsc::Receiver<Bytes>> {
        let mut state = self.state.lock();
        if !state.open {
            return None;
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        state.subscribers.push(tx);
        Some(rx)
    }

    /// Publish a chunk to current subscribers, waiting while any queue is full.
    pub async fn publish(&self, chunk: Bytes) {
        let subscribers = {
            let state = self.state.lock();
            if !state.open {
                return;
            }
            state.subscribers.clone()
        };

        let mut gone = false;
        for tx in &subscribers {
            gone |= tx.send(chunk.clone()).await.is_err();
        }
        if gone {
            self.state.lock().subscribers.retain(|tx| !tx.is_closed());
        }
    }

    /// Close the hub. Subscribers drain what is queued, then see end of stream.
    ///
    /// Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        state.subscribers.clear();
        std::mem::replace(&mut state.open, false)
    }

    /// Whether the hub still accepts subscribers.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }
}

impl fmt::Debug for OutputHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputHub")
            .field("kind", &self.kind)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Shared write end of a container's stdin.
#[derive(Clone, Default)]
pub struct ContainerStdin {
    writer: Arc<tokio::sync::Mutex<Option<BoxedWriter>>>,
}

impl ContainerStdin {
    /// A stdin handle that accepts no input.
    #[must_use]
    pub fn closed() -> Self {
        Self::default()
    }

    /// Install the write end once the process is spawned.
    pub async fn attach(&self, writer: BoxedWriter) {
        *self.writer.lock().await = Some(writer);
    }

    /// Write `buf` to the container.
    ///
    /// # Errors
    ///
    /// Fails with `BrokenPipe` once stdin is closed, or with the write error.
    pub async fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        writer.write_all(buf).await?;
        writer.flush().await
    }

    /// Close stdin so the process reads end of input. Idempotent.
    pub async fn close(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// Whether input can still be written.
    pub async fn is_open(&self) -> bool {
        self.writer.lock().await.is_some()
    }
}

/// The stream triple owned by a container.
#[derive(Clone)]
pub struct ContainerStreams {
    /// Standard input.
    pub stdin: ContainerStdin,
    /// Standard output, or the terminal.
    pub stdout: OutputHub,
    /// Standard error. Never carries data in TTY mode.
    pub stderr: OutputHub,
    /// Whether the process runs on a terminal.
    pub tty: bool,
}

impl ContainerStreams {
    /// Create open streams.
    #[must_use]
    pub fn new(tty: bool) -> Self {
        Self {
            stdin: ContainerStdin::closed(),
            stdout: OutputHub::new(StreamKind::Stdout),
            stderr: OutputHub::new(StreamKind::Stderr),
            tty,
        }
    }

    /// Hub for `kind`.
    #[must_use]
    pub const fn hub(&self, kind: StreamKind) -> &OutputHub {
        match kind {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    /// Close everything. Safe to call more than once.
    pub async fn close(&self) {
        self.stdin.close().await;
        self.stdout.close();
        self.stderr.close();
    }
}

/// The client side of an attach: whichever of the three streams were attached.
#[derive(Default)]
pub struct ClientStreams {
    /// Client input.
    pub stdin: Option<BoxedReader>,
    /// Client output.
    pub stdout: Option<BoxedWriter>,
    /// Client error output.
    pub stderr: Option<BoxedWriter>,
}

impl ClientStreams {
    /// Attach all three streams.
    pub fn new(
        stdin: impl AsyncRead + Send + Unpin + 'static,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdin: Some(Box::new(stdin)),
            stdout: Some(Box::new(stdout)),
            stderr: Some(Box::new(stderr)),
        }
    }

    /// The process's own standard streams.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), tokio::io::stderr())
    }

    /// Keep only the streams selected by the flags, dropping the rest.
    #[must_use]
    pub fn select(mut self, stdin: bool, stdout: bool, stderr: bool) -> Self {
        if !stdin {
            self.stdin = None;
        }
        if !stdout {
            self.stdout = None;
        }
        if !stderr {
            self.stderr = None;
        }
        self
    }
}

/// Splits a byte stream into newline-terminated log records.
#[derive(Debug, Default)]
struct LineFramer {
    partial: Vec<u8>,
}

impl LineFramer {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.partial.extend_from_slice(chunk);
        let mut lines = Vec::new();
        loop {
            let end = match self.partial.iter().position(|&b| b == b'\n') {
                Some(pos) if pos < MAX_LOG_LINE => pos + 1,
                _ if self.partial.len() >= MAX_LOG_LINE => MAX_LOG_LINE,
                _ => break,
            };
            lines.push(self.partial.drain(..end).collect());
        }
        lines
    }

    fn finish(&mut self) -> Option<Vec<u8>> {
        (!self.partial.is_empty()).then(|| std::mem::take(&mut self.partial))
    }
}

/// Copy `reader` into `hub` and `log` until end of stream, then close the hub.
pub async fn pump_output<R>(mut reader: R, hub: OutputHub, log: Option<JsonLogWriter>)
where
    R: AsyncRead + Unpin,
{
    let kind = hub.kind();
    let mut framer = LineFramer::default();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Some(log) = &log {
                    for line in framer.push(&buf[..n]) {
                        log.append(kind, &line);
                    }
                }
                hub.publish(Bytes::copy_from_slice(&buf[..n])).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            // A pty master reports EIO once every slave fd is closed.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => {
                tracing::warn!(stream = %kind, error = %e, "Container output read failed");
                break;
            }
        }
    }

    if let (Some(log), Some(rest)) = (&log, framer.finish()) {
        log.append(kind, &rest);
    }
    hub.close();
    tracing::debug!(stream = %kind, "Output pump finished");
}
