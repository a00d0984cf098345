//! Attach wire format between a client and a shim.
//!
//! ```text
//! +-----------+----------------+---------+
//! | Kind (1B) | Length (4B BE) | Payload |
//! +-----------+----------------+---------+
//! ```
//!
//! Control frames carry JSON. Stream frames carry raw bytes.

use std::io::{self, ErrorKind};

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::attach::SessionEnd;

/// Largest payload either side accepts.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const HEADER_LEN: usize = 5;

mod kind {
    pub const HELLO: u8 = 1;
    pub const STDIN: u8 = 2;
    pub const STDIN_CLOSED: u8 = 3;
    pub const STDOUT: u8 = 4;
    pub const STDERR: u8 = 5;
    pub const END: u8 = 6;
    pub const ERROR: u8 = 7;
}

/// First frame of every connection: what the client wants attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Forward client input.
    pub stdin: bool,
    /// Receive container stdout.
    pub stdout: bool,
    /// Receive container stderr.
    pub stderr: bool,
    /// Close the container's stdin when this client's input ends.
    pub stdin_once: bool,
    /// Detach sequence, e.g. `ctrl-p,ctrl-q`. The shim default when absent.
    pub detach_keys: Option<String>,
}

/// Last frame of a session that ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// How the session ended.
    pub end: SessionEnd,
    /// Set when the container exited during the session.
    pub exit_code: Option<i32>,
}

/// One message on an attach connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client: session request.
    Hello(Hello),
    /// Client: input bytes.
    Stdin(Bytes),
    /// Client: end of input.
    StdinClosed,
    /// Shim: container stdout.
    Stdout(Bytes),
    /// Shim: container stderr.
    Stderr(Bytes),
    /// Shim: the session is over.
    End(SessionSummary),
    /// Shim: the session failed or was refused.
    Error(String),
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, message.into())
}

fn to_json<T: Serialize>(value: &T) -> io::Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(io::Error::other)
}

fn from_json<T: DeserializeOwned>(payload: &[u8]) -> io::Result<T> {
    serde_json::from_slice(payload).map_err(|e| invalid(e.to_string()))
}

impl Frame {
    /// Header and payload, ready to write.
    ///
    /// # Errors
    ///
    /// Fails if the payload exceeds [`MAX_FRAME_LEN`].
    pub fn encode(&self) -> io::Result<Bytes> {
        let (kind, payload) = match self {
            Self::Hello(hello) => (kind::HELLO, to_json(hello)?),
            Self::Stdin(data) => (kind::STDIN, data.clone()),
            Self::StdinClosed => (kind::STDIN_CLOSED, Bytes::new()),
            Self::Stdout(data) => (kind::STDOUT, data.clone()),
            Self::Stderr(data) => (kind::STDERR, data.clone()),
            Self::End(summary) => (kind::END, to_json(summary)?),
            Self::Error(message) => (kind::ERROR, Bytes::copy_from_slice(message.as_bytes())),
        };

        let len = u32::try_from(payload.len())
            .ok()
            .filter(|_| payload.len() <= MAX_FRAME_LEN)
            .ok_or_else(|| invalid(format!("frame of {} bytes is too large", payload.len())))?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(kind);
        buf.put_u32(len);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    fn decode(kind: u8, payload: Bytes) -> io::Result<Self> {
        Ok(match kind {
            kind::HELLO => Self::Hello(from_json(&payload)?),
            kind::STDIN => Self::Stdin(payload),
            kind::STDIN_CLOSED => Self::StdinClosed,
            kind::STDOUT => Self::Stdout(payload),
            kind::STDERR => Self::Stderr(payload),
            kind::END => Self::End(from_json(&payload)?),
            kind::ERROR => Self::Error(String::from_utf8_lossy(&payload).into_owned()),
            other => return Err(invalid(format!("unknown frame kind {other}"))),
        })
    }
}

/// Write one frame and flush.
///
/// # Errors
///
/// Fails on an oversized frame or a write error.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()?).await?;
    writer.flush().await
}

/// Read one frame. `None` when the peer closed the connection between frames.
///
/// # Errors
///
/// Fails on a truncated or malformed frame.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let kind = match reader.read_u8().await {
        Ok(kind) => kind,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    let len = usize::try_from(reader.read_u32().await?).unwrap_or(usize::MAX);
    if len > MAX_FRAME_LEN {
        return Err(invalid(format!("frame of {len} bytes is too large")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Frame::decode(kind, Bytes::from(payload)).map(Some)
}
