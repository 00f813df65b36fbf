//! Framed stream transport between the orchestrator and its nodes
//!
//! A [`Connection`] wraps one Unix domain socket stream and moves whole
//! frames across it. Any failure leaves the connection unusable; callers
//! open a new one instead of retrying on the old.

pub mod framing;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::Instant;

pub use framing::{FramedReader, FramedWriter, MAX_FRAME_LEN};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Errors raised while moving frames
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket exists but refused or failed the connection for a
    /// reason other than "not listening yet"
    #[error("failed to connect to {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Nothing accepted the connection before the deadline
    #[error("timed out after {timeout:?} connecting to {}", .path.display())]
    ConnectTimeout { path: PathBuf, timeout: Duration },

    /// Peer closed the stream before a whole frame moved
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The stream stopped accepting bytes mid-frame
    #[error("short write: peer stopped accepting bytes mid-frame")]
    ShortWrite,

    /// Frame exceeds the configured limit
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The connection failed earlier and must not be reused
    #[error("connection is unusable after an earlier failure")]
    Broken,

    /// Any other I/O failure
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// One framed stream to a node socket
#[derive(Debug)]
pub struct Connection {
    reader: FramedReader<OwnedReadHalf>,
    writer: FramedWriter<OwnedWriteHalf>,
    socket_path: PathBuf,
    broken: bool,
}

impl Connection {
    /// Wrap an already connected stream
    #[must_use]
    pub fn from_stream(stream: UnixStream, socket_path: impl Into<PathBuf>) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FramedReader::new(read_half),
            writer: FramedWriter::new(write_half),
            socket_path: socket_path.into(),
            broken: false,
        }
    }

    /// Send one frame
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Broken`] if the connection already failed,
    /// otherwise any framing error, after which the connection is broken
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if self.broken {
            return Err(TransportError::Broken);
        }
        // Stays set if the write is cancelled mid-frame
        self.broken = true;
        self.writer.write_frame(payload).await?;
        self.broken = false;
        Ok(())
    }

    /// Receive one frame
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Broken`] if the connection already failed,
    /// otherwise any framing error, after which the connection is broken
    pub async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        if self.broken {
            return Err(TransportError::Broken);
        }
        self.broken = true;
        let payload = self.reader.read_frame().await?;
        self.broken = false;
        Ok(payload)
    }

    /// Socket this connection was opened against
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether an earlier failure made this connection unusable
    #[must_use]
    pub const fn is_broken(&self) -> bool {
        self.broken
    }
}

/// Connect to a node socket, waiting up to `timeout` for it to accept
///
/// A missing socket file or a refused connection is retried with
/// exponential backoff (10 ms doubling to 200 ms) until the deadline.
///
/// # Errors
///
/// Returns `ConnectTimeout` if the deadline passes, or `Connect` for any
/// failure that retrying cannot fix
pub async fn connect(socket_path: &Path, timeout: Duration) -> Result<Connection, TransportError> {
    let deadline = Instant::now() + timeout;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match tokio::time::timeout_at(deadline, UnixStream::connect(socket_path)).await {
            Ok(Ok(stream)) => return Ok(Connection::from_stream(stream, socket_path)),
            Ok(Err(e)) if is_retryable(&e) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                tracing::trace!(
                    path = %socket_path.display(),
                    error = %e,
                    ?backoff,
                    "socket not ready, retrying"
                );
                tokio::time::sleep(backoff.min(deadline - now)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    path: socket_path.to_path_buf(),
                    source: e,
                });
            }
            Err(_) => break,
        }
    }

    Err(TransportError::ConnectTimeout {
        path: socket_path.to_path_buf(),
        timeout,
    })
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}
