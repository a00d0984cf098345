//! One attach between a client and a container.

use std::io::ErrorKind;

use berth_common::{BerthError, BerthResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinError;

use super::escape::{DetachKeys, EscapeScanner, Scan};
use crate::exec::{BoxedReader, BoxedWriter, ClientStreams, ContainerStdin, ContainerStreams};

const READ_BUF_SIZE: usize = 32 * 1024;

/// Why a session ended. All three are clean terminations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEnd {
    /// The client sent the detach sequence. The container keeps running.
    Detached,
    /// The container's output reached end of stream.
    ContainerExited,
    /// The client closed its input or output.
    ClientDisconnected,
}

/// Per-session settings.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Detach sequence scanned for in client input.
    pub detach_keys: DetachKeys,
    /// Close the container's stdin when this session's client input ends.
    /// Only honoured without a TTY.
    pub stdin_once: bool,
}

/// Outcome of the client to container direction.
enum Inbound {
    /// The session is over.
    Ended(SessionEnd),
    /// Input is finished but output keeps draining until the container is done.
    InputClosed,
}

/// Client read/write failures that mean the client went away.
fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof
    )
}

fn joined<T>(result: Result<BerthResult<T>, JoinError>) -> BerthResult<T> {
    result.map_err(|e| BerthError::Internal {
        message: format!("attach task failed: {e}"),
    })?
}

/// A single attach: created, run to completion, discarded.
///
/// Output subscriptions are taken in [`StreamSession::new`], so a session
/// built before the container starts sees all of its output.
pub struct StreamSession {
    stdin: ContainerStdin,
    stdout: Option<mpsc::Receiver<Bytes>>,
    stderr: Option<mpsc::Receiver<Bytes>>,
    tty: bool,
    options: SessionOptions,
}

impl StreamSession {
    /// Prepare a session against `container`.
    #[must_use]
    pub fn new(container: &ContainerStreams, options: SessionOptions) -> Self {
        Self {
            stdin: container.stdin.clone(),
            stdout: container.stdout.subscribe(),
            stderr: container.stderr.subscribe(),
            tty: container.tty,
            options,
        }
    }

    /// Pump both directions until a terminal condition.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Stream`] on a real I/O failure. Detach, client
    /// disconnect and container exit are reported through [`SessionEnd`].
    pub async fn run(self, client: ClientStreams) -> BerthResult<SessionEnd> {
        let Self {
            stdin,
            stdout,
            stderr,
            tty,
            options,
        } = self;

        let mut inbound = match client.stdin {
            Some(reader) => {
                let scanner = EscapeScanner::new(options.detach_keys);
                let stdin_once = options.stdin_once && !tty;
                tokio::spawn(copy_inbound(reader, stdin, scanner, tty, stdin_once))
            }
            None => tokio::spawn(std::future::pending()),
        };
        let mut outbound = tokio::spawn(copy_outbound(stdout, stderr, client.stdout, client.stderr));

        let result = tokio::select! {
            res = &mut inbound => match joined(res) {
                Ok(Inbound::Ended(end)) => Ok(end),
                Ok(Inbound::InputClosed) => joined((&mut outbound).await),
                Err(e) => Err(e),
            },
            res = &mut outbound => joined(res),
        };

        // Dropping the aborted task closes the client stream it was blocked on.
        inbound.abort();
        outbound.abort();

        match &result {
            Ok(end) => tracing::debug!(?end, tty, "Attach session finished"),
            Err(e) => tracing::warn!(error = %e, "Attach session failed"),
        }
        result
    }
}

async fn copy_inbound(
    mut reader: BoxedReader,
    stdin: ContainerStdin,
    mut scanner: EscapeScanner,
    tty: bool,
    stdin_once: bool,
) -> BerthResult<Inbound> {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut forward = Vec::with_capacity(READ_BUF_SIZE);

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_disconnect(&e) => return Ok(Inbound::Ended(SessionEnd::ClientDisconnected)),
            Err(source) => {
                return Err(BerthError::Stream {
                    direction: "client->container",
                    source,
                });
            }
        };

        forward.clear();
        let scan = scanner.feed(&buf[..n], &mut forward);
        if !forward.is_empty() {
            if let Err(e) = stdin.write_all(&forward).await {
                return container_gone(e);
            }
        }
        if scan == Scan::Detach {
            return Ok(Inbound::Ended(SessionEnd::Detached));
        }
    }

    let held = scanner.finish();
    if !held.is_empty() {
        if let Err(e) = stdin.write_all(&held).await {
            return container_gone(e);
        }
    }

    if tty || !stdin_once {
        return Ok(Inbound::Ended(SessionEnd::ClientDisconnected));
    }

    stdin.close().await;
    tracing::debug!("Client input ended, container stdin closed");
    Ok(Inbound::InputClosed)
}

/// A failed write into the container. A closed pipe means the process no
/// longer reads input; its output decides when the session ends.
fn container_gone(err: std::io::Error) -> BerthResult<Inbound> {
    if err.kind() == ErrorKind::BrokenPipe {
        return Ok(Inbound::InputClosed);
    }
    Err(BerthError::Stream {
        direction: "container stdin",
        source: err,
    })
}

async fn recv(rx: &mut Option<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn copy_outbound(
    mut stdout_rx: Option<mpsc::Receiver<Bytes>>,
    mut stderr_rx: Option<mpsc::Receiver<Bytes>>,
    mut stdout: Option<BoxedWriter>,
    mut stderr: Option<BoxedWriter>,
) -> BerthResult<SessionEnd> {
    while stdout_rx.is_some() || stderr_rx.is_some() {
        let (is_stdout, received) = tokio::select! {
            res = recv(&mut stdout_rx) => (true, res),
            res = recv(&mut stderr_rx) => (false, res),
        };

        let Some(chunk) = received else {
            if is_stdout {
                stdout_rx = None;
            } else {
                stderr_rx = None;
            }
            continue;
        };

        // Unattached streams are still drained so container exit is observed.
        let writer = if is_stdout { &mut stdout } else { &mut stderr };
        let Some(writer) = writer else {
            continue;
        };

        let written = match writer.write_all(&chunk).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {}
            Err(e) if is_disconnect(&e) => return Ok(SessionEnd::ClientDisconnected),
            Err(source) => {
                return Err(BerthError::Stream {
                    direction: "container->client",
                    source,
                });
            }
        }
    }

    Ok(SessionEnd::ContainerExited)
}
