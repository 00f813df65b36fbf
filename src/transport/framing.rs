//! Length-prefixed framing over any byte stream
//!
//! Every frame is a 4-byte big-endian payload length followed by exactly
//! that many payload bytes.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;

/// Largest payload accepted in either direction (16 MiB)
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Reads whole frames from a byte stream
#[derive(Debug)]
pub struct FramedReader<R> {
    inner: R,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    #[must_use]
    pub const fn new(inner: R) -> Self {
        Self {
            inner,
            max_len: MAX_FRAME_LEN,
        }
    }

    /// Override the largest accepted payload
    #[must_use]
    pub const fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Read the next frame's payload
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the peer closes before a whole frame
    /// arrives, `FrameTooLarge` if the announced length exceeds the limit,
    /// or `Io` for any other read failure
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut header = [0u8; HEADER_LEN];
        self.inner
            .read_exact(&mut header)
            .await
            .map_err(read_error)?;

        let len = usize::try_from(u32::from_be_bytes(header)).unwrap_or(usize::MAX);
        if len > self.max_len {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }

        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(read_error)?;
        Ok(payload)
    }

    #[must_use]
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes whole frames to a byte stream
#[derive(Debug)]
pub struct FramedWriter<W> {
    inner: W,
    max_len: usize,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    #[must_use]
    pub const fn new(inner: W) -> Self {
        Self {
            inner,
            max_len: MAX_FRAME_LEN,
        }
    }

    /// Override the largest accepted payload
    #[must_use]
    pub const fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Write one frame and flush it
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` before writing anything if the payload
    /// exceeds the limit, `ShortWrite` if the stream stops accepting bytes
    /// mid-frame, `ConnectionClosed` if the peer is gone, or `Io` otherwise
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let len = payload.len();
        let header = match u32::try_from(len) {
            Ok(header) if len <= self.max_len => header.to_be_bytes(),
            _ => {
                return Err(TransportError::FrameTooLarge {
                    len,
                    max: self.max_len,
                });
            }
        };

        let mut frame = Vec::with_capacity(HEADER_LEN + len);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(payload);

        self.inner.write_all(&frame).await.map_err(write_error)?;
        self.inner.flush().await.map_err(write_error)
    }

    #[must_use]
    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn read_error(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => {
            TransportError::ConnectionClosed
        }
        _ => TransportError::Io(e),
    }
}

fn write_error(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::WriteZero => TransportError::ShortWrite,
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
            TransportError::ConnectionClosed
        }
        _ => TransportError::Io(e),
    }
}
