//! `berth shim`: supervises one released container until it exits.

use std::io::{self, ErrorKind, Write};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use berth_common::{BerthError, BerthResult, ContainerId};
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf, duplex};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

use super::protocol::{Frame, Hello, SessionSummary, read_frame, write_frame};
use crate::attach::{SessionEnd, SessionOptions, StreamSession};
use crate::exec::ClientStreams;
use crate::runtime::{ContainerStatus, RuntimeConfig, RuntimeEvent, RuntimeMonitor};

const READ_BUF_SIZE: usize = 32 * 1024;

/// Input frames buffered per client.
const INPUT_QUEUE: usize = 16;

/// The single line a shim writes to its stdout once it is ready.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyLine {
    /// Why the container could not be taken over or started.
    pub error: Option<String>,
}

fn report_ready(out: &mut impl Write, error: Option<&BerthError>) {
    let line = ReadyLine {
        error: error.map(ToString::to_string),
    };
    let written = serde_json::to_writer(&mut *out, &line)
        .map_err(io::Error::other)
        .and_then(|()| {
            out.write_all(b"\n")?;
            out.flush()
        });
    if let Err(e) = written {
        tracing::warn!(error = %e, "Could not report readiness");
    }
}

/// Take over the released container `id`, start it and serve attach
/// clients on its socket until it exits.
///
/// With `attach_first`, the first client's session is set up before the
/// process starts so that it sees all output. Readiness, or the reason
/// there is none, is written to `ready` as a [`ReadyLine`].
///
/// # Errors
///
/// Fails if the container cannot be adopted or started.
pub async fn serve(
    config: RuntimeConfig,
    id: &str,
    attach_first: bool,
    mut ready: impl Write + Send,
) -> BerthResult<()> {
    let drain = config.drain_timeout;
    let monitor = RuntimeMonitor::new(config);
    let (shim, listener) = match bind(monitor, id) {
        Ok(bound) => bound,
        Err(e) => {
            report_ready(&mut ready, Some(&e));
            return Err(e);
        }
    };
    let socket = shim.monitor.config().paths.container_socket(shim.id.as_str());

    let auto_remove = shim.monitor.inspect(shim.id.as_str())?.config.auto_remove;
    let mut events = shim.monitor.subscribe_events();
    let exited = shim.monitor.waiter(shim.id.as_str(), None)?;
    tokio::pin!(exited);
    let mut sessions = JoinSet::new();

    let started = if attach_first {
        report_ready(&mut ready, None);
        shim.start_attached(&listener, &mut sessions).await
    } else {
        let started = shim.monitor.start(shim.id.as_str()).await;
        report_ready(&mut ready, started.as_ref().err());
        started
    };
    if let Err(e) = started {
        let _ = std::fs::remove_file(&socket);
        return Err(e);
    }

    let exit_code = loop {
        tokio::select! {
            code = &mut exited => break code,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    sessions.spawn(shim.clone().attach(stream));
                }
                Err(e) => tracing::warn!(error = %e, "Accept failed"),
            },
        }
    };
    drop(listener);
    if let Err(e) = std::fs::remove_file(&socket) {
        tracing::debug!(error = %e, "Socket already gone");
    }
    tracing::info!(container_id = %shim.id, exit_code = ?exit_code.as_ref().ok(), "Supervision over");

    if auto_remove
        && tokio::time::timeout(drain, removed(&mut events, shim.id.as_str()))
            .await
            .is_err()
    {
        tracing::warn!(container_id = %shim.id, "Auto-remove not observed");
    }

    // Sessions still flushing output or their summary.
    let drained = tokio::time::timeout(drain, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(container_id = %shim.id, "Attach sessions still open, dropping them");
        sessions.abort_all();
    }

    exit_code.map(drop)
}

fn bind(monitor: RuntimeMonitor, id: &str) -> BerthResult<(Shim, UnixListener)> {
    let id = monitor.adopt(id)?;
    let paths = &monitor.config().paths;
    std::fs::create_dir_all(paths.sockets())?;

    let socket = paths.container_socket(id.as_str());
    match std::fs::remove_file(&socket) {
        Ok(()) => tracing::debug!(socket = %socket.display(), "Removed stale socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(&socket)?;
    tracing::info!(container_id = %id, socket = %socket.display(), "Supervising");
    Ok((Shim { monitor, id }, listener))
}

async fn removed(events: &mut broadcast::Receiver<RuntimeEvent>, id: &str) {
    loop {
        match events.recv().await {
            Ok(RuntimeEvent::ContainerRemoved { id: gone, .. }) if gone == id => return,
            Err(broadcast::error::RecvError::Closed) => return,
            _ => {}
        }
    }
}

#[derive(Clone)]
struct Shim {
    monitor: RuntimeMonitor,
    id: ContainerId,
}

/// A client whose session is subscribed but not yet running.
struct Pending {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    hello: Hello,
    session: StreamSession,
    exited: BoxFuture<'static, BerthResult<i32>>,
}

async fn refuse(writer: &mut OwnedWriteHalf, err: &BerthError) {
    tracing::debug!(error = %err, "Refusing attach");
    if let Err(e) = write_frame(writer, &Frame::Error(err.to_string())).await {
        tracing::debug!(error = %e, "Client gone before the refusal");
    }
    let _ = writer.shutdown().await;
}

impl Shim {
    /// Accept the launching client, subscribe it, then start the process.
    async fn start_attached(
        &self,
        listener: &UnixListener,
        sessions: &mut JoinSet<()>,
    ) -> BerthResult<()> {
        let (stream, _) = listener.accept().await?;
        let pending = self.prepare(stream, false).await;
        let started = self.monitor.start(self.id.as_str()).await;

        match (pending, &started) {
            (Some(pending), Ok(())) => {
                sessions.spawn(pending.run());
            }
            (Some(mut pending), Err(e)) => refuse(&mut pending.writer, e).await,
            (None, _) => {}
        }
        started
    }

    async fn attach(self, stream: UnixStream) {
        if let Some(pending) = self.prepare(stream, true).await {
            pending.run().await;
        }
    }

    async fn prepare(&self, stream: UnixStream, require_running: bool) -> Option<Pending> {
        let (mut reader, mut writer) = stream.into_split();
        let hello = match read_frame(&mut reader).await {
            Ok(Some(Frame::Hello(hello))) => hello,
            Ok(other) => {
                tracing::debug!(?other, "Connection without a session request");
                return None;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Unreadable session request");
                return None;
            }
        };

        match self.session(&hello, require_running) {
            Ok((session, exited)) => Some(Pending {
                reader,
                writer,
                hello,
                session,
                exited,
            }),
            Err(e) => {
                refuse(&mut writer, &e).await;
                None
            }
        }
    }

    fn session(
        &self,
        hello: &Hello,
        require_running: bool,
    ) -> BerthResult<(StreamSession, BoxFuture<'static, BerthResult<i32>>)> {
        let record = self.monitor.inspect(self.id.as_str())?;
        if require_running && record.status != ContainerStatus::Running {
            return Err(BerthError::InvalidState {
                id: record.id.to_string(),
                status: record.status.to_string(),
                operation: "attach to".to_string(),
            });
        }

        let detach_keys = match &hello.detach_keys {
            Some(keys) => keys.parse()?,
            None => self.monitor.config().detach_keys.clone(),
        };
        let streams = self.monitor.streams(self.id.as_str())?;
        let exited = self.monitor.waiter(self.id.as_str(), None)?;
        let session = StreamSession::new(
            &streams,
            SessionOptions {
                detach_keys,
                stdin_once: hello.stdin_once,
            },
        );
        Ok((session, Box::pin(exited)))
    }
}

impl Pending {
    async fn run(self) {
        let Self {
            reader,
            writer,
            hello,
            session,
            exited,
        } = self;

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let input = tokio::spawn(forward_input(reader, input_tx));
        let (stdout, stdout_rx) = duplex(READ_BUF_SIZE);
        let (stderr, stderr_rx) = duplex(READ_BUF_SIZE);
        let output = tokio::spawn(forward_output(stdout_rx, stderr_rx, writer));

        let client = ClientStreams::new(ChannelReader::new(input_rx), stdout, stderr).select(
            hello.stdin,
            hello.stdout,
            hello.stderr,
        );
        let result = session.run(client).await;
        input.abort();

        let Ok(Ok(mut writer)) = output.await else {
            tracing::debug!("Client gone before the session summary");
            return;
        };
        let frame = match result {
            Ok(end) => {
                let exit_code = match end {
                    SessionEnd::ContainerExited => exited.await.ok(),
                    SessionEnd::Detached | SessionEnd::ClientDisconnected => None,
                };
                Frame::End(SessionSummary { end, exit_code })
            }
            Err(e) => Frame::Error(e.to_string()),
        };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::debug!(error = %e, "Client gone before the session summary");
        }
        let _ = writer.shutdown().await;
    }
}

/// Client frames into the session's input channel.
///
/// End of input is sent as a dropped sender; a vanished client as a reset.
async fn forward_input(mut reader: OwnedReadHalf, tx: mpsc::Sender<io::Result<Bytes>>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Stdin(data))) => {
                if tx.send(Ok(data)).await.is_err() {
                    return;
                }
            }
            Ok(Some(Frame::StdinClosed)) => return,
            Ok(Some(other)) => tracing::debug!(?other, "Ignoring unexpected client frame"),
            Ok(None) | Err(_) => {
                let _ = tx.send(Err(ErrorKind::ConnectionReset.into())).await;
                return;
            }
        }
    }
}

/// Session output into frames. Hands the socket back once both sides end.
async fn forward_output(
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    mut writer: OwnedWriteHalf,
) -> io::Result<OwnedWriteHalf> {
    let mut out_buf = vec![0u8; READ_BUF_SIZE];
    let mut err_buf = vec![0u8; READ_BUF_SIZE];
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        let frame = tokio::select! {
            n = stdout.read(&mut out_buf), if out_open => match n? {
                0 => {
                    out_open = false;
                    continue;
                }
                n => Frame::Stdout(Bytes::copy_from_slice(&out_buf[..n])),
            },
            n = stderr.read(&mut err_buf), if err_open => match n? {
                0 => {
                    err_open = false;
                    continue;
                }
                n => Frame::Stderr(Bytes::copy_from_slice(&err_buf[..n])),
            },
        };
        write_frame(&mut writer, &frame).await?;
    }
    Ok(writer)
}

/// [`AsyncRead`] over a channel of chunks; a closed channel reads as end of input.
struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    pending: Bytes,
}

impl ChannelReader {
    const fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.pending.is_empty() {
            match ready!(self.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => self.pending = chunk,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = self.pending.len().min(buf.remaining());
        let chunk = self.pending.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}
