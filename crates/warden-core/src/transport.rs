//! Duplex local channel to the service endpoint.
//!
//! On unix the endpoint is a domain socket path; on windows it is a named
//! pipe (`\\.\pipe\<name>`). The transport only moves newline-delimited
//! frames and knows nothing about their content.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::protocol::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out connecting to {endpoint} after {after:?}")]
    Timeout { endpoint: String, after: Duration },
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(PathBuf);

impl Endpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Well-known endpoint for an application name.
    #[cfg(windows)]
    pub fn platform_default(name: &str) -> Self {
        let mut pipe = String::from(r"\\.\pipe\");
        let mut chars = name.chars();
        if let Some(first) = chars.next() {
            pipe.extend(first.to_uppercase());
            pipe.push_str(chars.as_str());
        }
        Self(PathBuf::from(pipe))
    }

    /// Well-known endpoint for an application name.
    #[cfg(not(windows))]
    pub fn platform_default(name: &str) -> Self {
        Self(
            runtime_dir()
                .join(name)
                .join(format!("{name}.sock")),
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Per-user directory for sockets and lock files.
pub fn runtime_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// One live duplex handle. Split it to read and write from separate tasks.
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Connection {
    pub fn from_stream<S>(stream: S, max_frame_bytes: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader {
                inner: BufReader::new(Box::new(read_half)),
                max_frame_bytes,
            },
            writer: FrameWriter {
                inner: Some(Box::new(write_half)),
            },
        }
    }

    pub fn split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// Opens a channel to `endpoint`, giving up after `timeout`.
pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Connection, TransportError> {
    connect_with_limit(endpoint, timeout, DEFAULT_MAX_FRAME_BYTES).await
}

pub async fn connect_with_limit(
    endpoint: &Endpoint,
    timeout: Duration,
    max_frame_bytes: usize,
) -> Result<Connection, TransportError> {
    match tokio::time::timeout(timeout, open_stream(endpoint, max_frame_bytes)).await {
        Ok(Ok(connection)) => Ok(connection),
        Ok(Err(source)) => Err(TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        }),
        Err(_) => Err(TransportError::Timeout {
            endpoint: endpoint.to_string(),
            after: timeout,
        }),
    }
}

#[cfg(unix)]
async fn open_stream(endpoint: &Endpoint, max_frame_bytes: usize) -> io::Result<Connection> {
    let stream = tokio::net::UnixStream::connect(endpoint.path()).await?;
    Ok(Connection::from_stream(stream, max_frame_bytes))
}

#[cfg(windows)]
async fn open_stream(endpoint: &Endpoint, max_frame_bytes: usize) -> io::Result<Connection> {
    use tokio::net::windows::named_pipe::ClientOptions;

    const ERROR_PIPE_BUSY: i32 = 231;

    loop {
        match ClientOptions::new().open(endpoint.path()) {
            Ok(client) => return Ok(Connection::from_stream(client, max_frame_bytes)),
            Err(err) if err.raw_os_error() == Some(ERROR_PIPE_BUSY) => {}
            Err(err) => return Err(err),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(not(any(unix, windows)))]
async fn open_stream(_endpoint: &Endpoint, _max_frame_bytes: usize) -> io::Result<Connection> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "local endpoints are not supported on this platform",
    ))
}

pub struct FrameReader {
    inner: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    max_frame_bytes: usize,
}

impl FrameReader {
    /// Next newline-terminated frame, `None` once the peer has closed.
    ///
    /// A line longer than the frame limit is returned truncated to just past
    /// the limit (so the codec reports it as oversized) and the remainder of
    /// that line is discarded.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let limit = self.max_frame_bytes as u64 + 2;
        let mut line = Vec::new();
        let read = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut line)
            .await
            .map_err(TransportError::Read)?;
        if read == 0 {
            return Ok(None);
        }
        if !line.ends_with(b"\n") && read as u64 == limit {
            self.skip_rest_of_line().await?;
        }
        Ok(Some(line))
    }

    async fn skip_rest_of_line(&mut self) -> Result<(), TransportError> {
        loop {
            let (consumed, done) = {
                let buf = self.inner.fill_buf().await.map_err(TransportError::Read)?;
                if buf.is_empty() {
                    return Ok(());
                }
                match buf.iter().position(|byte| *byte == b'\n') {
                    Some(idx) => (idx + 1, true),
                    None => (buf.len(), false),
                }
            };
            self.inner.consume(consumed);
            if done {
                return Ok(());
            }
        }
    }
}

pub struct FrameWriter {
    inner: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl FrameWriter {
    /// Writes a whole frame. `write_all` retries short writes internally.
    pub async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let writer = self.inner.as_mut().ok_or(TransportError::Closed)?;
        writer
            .write_all(frame)
            .await
            .map_err(TransportError::Write)?;
        writer.flush().await.map_err(TransportError::Write)
    }

    /// Releases the write side. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.inner.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}
