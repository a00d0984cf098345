//! Launching shims and attaching to them.

#![allow(unsafe_code)]

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;

use berth_common::{BerthError, BerthPaths, BerthResult, ContainerId};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::Command;

use super::protocol::{Frame, Hello, SessionSummary, read_frame, write_frame};
use super::server::ReadyLine;
use crate::attach::SessionEnd;
use crate::exec::{BoxedReader, BoxedWriter, ClientStreams};

const READ_BUF_SIZE: usize = 32 * 1024;

/// Start `program shim` for the released container `id` in a session of its
/// own and wait until it reports ready.
///
/// The shim outlives this process. With `attach_first` it holds the process
/// back until the first client connects.
///
/// # Errors
///
/// Fails if the shim cannot be spawned or reports an error.
pub async fn spawn(
    program: &Path,
    paths: &BerthPaths,
    id: &ContainerId,
    attach_first: bool,
) -> BerthResult<()> {
    let log_path = paths.container_shim_log(id.as_str());
    let log = std::fs::File::create(&log_path)?;
    let root = std::path::absolute(&paths.root)?;

    let mut cmd = Command::new(program);
    cmd.arg("--root").arg(root).arg("shim");
    if attach_first {
        cmd.arg("--attach-first");
    }
    cmd.arg(id.as_str())
        .current_dir("/")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(log))
        .kill_on_drop(false);
    // SAFETY: the hook runs between fork and exec and only issues a syscall.
    unsafe {
        cmd.pre_exec(|| {
            rustix::process::setsid()?;
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| {
        BerthError::supervisor(format!("cannot start {}: {e}", program.display()))
    })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BerthError::supervisor("shim stdout not captured"))?;

    let mut line = String::new();
    BufReader::new(stdout).read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Err(BerthError::supervisor(format!(
            "shim exited before it was ready; see {}",
            log_path.display()
        )));
    }

    let ready: ReadyLine = serde_json::from_str(&line)?;
    tracing::debug!(container_id = %id, pid = ?child.id(), "Shim ready");
    match ready.error {
        None => Ok(()),
        Some(message) => Err(BerthError::Supervisor { message }),
    }
}

/// Run an attach session against the shim listening on `socket`.
///
/// # Errors
///
/// Fails if the shim is unreachable, refuses the session or the
/// connection breaks before the session summary.
pub async fn attach(
    socket: &Path,
    hello: Hello,
    client: ClientStreams,
) -> BerthResult<SessionSummary> {
    let stream = UnixStream::connect(socket).await.map_err(|e| {
        BerthError::supervisor(format!("cannot reach {}: {e}", socket.display()))
    })?;
    let (mut reader, mut writer) = stream.into_split();
    write_frame(&mut writer, &Frame::Hello(hello))
        .await
        .map_err(|source| BerthError::Stream {
            direction: "client->shim",
            source,
        })?;

    let ClientStreams {
        stdin,
        mut stdout,
        mut stderr,
    } = client;
    let input = tokio::spawn(send_input(stdin, writer));
    let result = receive_output(&mut reader, &mut stdout, &mut stderr).await;
    input.abort();
    result
}

async fn send_input(stdin: Option<BoxedReader>, mut writer: OwnedWriteHalf) {
    // Holding the write half open keeps the session from reading a disconnect.
    let Some(mut stdin) = stdin else {
        return std::future::pending().await;
    };

    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let frame = match stdin.read(&mut buf).await {
            Ok(0) => Frame::StdinClosed,
            Ok(n) => Frame::Stdin(Bytes::copy_from_slice(&buf[..n])),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "Client input failed");
                return;
            }
        };
        let closed = frame == Frame::StdinClosed;
        if write_frame(&mut writer, &frame).await.is_err() {
            return;
        }
        if closed {
            return std::future::pending().await;
        }
    }
}

async fn receive_output(
    reader: &mut OwnedReadHalf,
    stdout: &mut Option<BoxedWriter>,
    stderr: &mut Option<BoxedWriter>,
) -> BerthResult<SessionSummary> {
    let disconnected = SessionSummary {
        end: SessionEnd::ClientDisconnected,
        exit_code: None,
    };

    loop {
        let frame = read_frame(reader)
            .await
            .map_err(|source| BerthError::Stream {
                direction: "shim->client",
                source,
            })?;
        let delivered = match frame {
            Some(Frame::Stdout(data)) => deliver(stdout, &data).await?,
            Some(Frame::Stderr(data)) => deliver(stderr, &data).await?,
            Some(Frame::End(summary)) => return Ok(summary),
            Some(Frame::Error(message)) => return Err(BerthError::Supervisor { message }),
            Some(other) => {
                tracing::debug!(?other, "Ignoring unexpected shim frame");
                true
            }
            None => {
                return Err(BerthError::supervisor(
                    "shim closed the connection before the session ended",
                ));
            }
        };
        if !delivered {
            return Ok(disconnected);
        }
    }
}

/// Write to a client stream. `false` once the client has gone away.
async fn deliver(writer: &mut Option<BoxedWriter>, data: &[u8]) -> BerthResult<bool> {
    let Some(writer) = writer.as_mut() else {
        return Ok(true);
    };
    let written = async {
        writer.write_all(data).await?;
        writer.flush().await
    };
    match written.await {
        Ok(()) => Ok(true),
        Err(e) if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) => Ok(false),
        Err(source) => Err(BerthError::Stream {
            direction: "container->client",
            source,
        }),
    }
}
