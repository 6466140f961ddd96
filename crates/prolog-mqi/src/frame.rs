use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use crate::defaults::MAX_FRAME_BYTES;

/// Where the server is listening.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerEndpoint {
    /// TCP on the loopback interface.
    Tcp { port: u16 },
    /// A Unix domain socket file.
    #[cfg(unix)]
    Unix { path: PathBuf },
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerEndpoint::Tcp { port } => write!(f, "127.0.0.1:{port}"),
            #[cfg(unix)]
            ServerEndpoint::Unix { path } => write!(f, "{}", path.display()),
        }
    }
}

/// Transport faults below the session layer.
#[derive(Debug, Error)]
pub(crate) enum FrameError {
    #[error("socket i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {reason}")]
    Protocol { reason: String },
    #[error("frame payload was not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Message-oriented view of the server socket.
///
/// One frame is `<decimal byte count>.\n<payload>`. The server announces
/// liveness during long-running work by emitting a single `.` byte ahead of
/// the next frame header; those markers are consumed here and counted, never
/// surfaced.
pub(crate) struct FrameStream {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    heartbeats: u64,
}

impl std::fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStream")
            .field("heartbeats", &self.heartbeats)
            .finish_non_exhaustive()
    }
}

impl FrameStream {
    pub(crate) async fn connect(endpoint: &ServerEndpoint) -> Result<Self, FrameError> {
        match endpoint {
            ServerEndpoint::Tcp { port } => {
                let stream = TcpStream::connect(("127.0.0.1", *port)).await?;
                let (read, write) = stream.into_split();
                Ok(Self::from_parts(Box::new(read), Box::new(write)))
            }
            #[cfg(unix)]
            ServerEndpoint::Unix { path } => {
                let stream = UnixStream::connect(path).await?;
                let (read, write) = stream.into_split();
                Ok(Self::from_parts(Box::new(read), Box::new(write)))
            }
        }
    }

    pub(crate) fn from_parts(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            heartbeats: 0,
        }
    }

    /// Frames and sends one message. The payload is the trimmed message plus
    /// a trailing newline, which is included in the announced byte count.
    pub(crate) async fn send(&mut self, message: &str) -> Result<(), FrameError> {
        let payload = format!("{}\n", message.trim());
        let header = format!("{}.\n", payload.len());
        debug!(message = message.trim(), "sending frame");
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(payload.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads the next frame payload, consuming any heartbeat markers that
    /// precede its header.
    pub(crate) async fn recv(&mut self) -> Result<String, FrameError> {
        let mut length: usize = 0;
        let mut seen_digit = false;
        loop {
            let byte = self.reader.read_u8().await?;
            match byte {
                b'.' if !seen_digit => {
                    self.heartbeats += 1;
                    debug!(total = self.heartbeats, "heartbeat");
                }
                b'.' => {
                    let newline = self.reader.read_u8().await?;
                    if newline != b'\n' {
                        return Err(FrameError::Protocol {
                            reason: format!(
                                "expected newline after frame header, found 0x{newline:02x}"
                            ),
                        });
                    }
                    if length == 0 {
                        return Err(FrameError::Protocol {
                            reason: "frame announces a zero-length payload".into(),
                        });
                    }
                    let mut payload = vec![0u8; length];
                    self.reader.read_exact(&mut payload).await?;
                    let text = String::from_utf8(payload)?;
                    debug!(bytes = length, "received frame");
                    return Ok(text);
                }
                b'0'..=b'9' => {
                    seen_digit = true;
                    length = length * 10 + usize::from(byte - b'0');
                    if length > MAX_FRAME_BYTES {
                        return Err(FrameError::Protocol {
                            reason: format!("frame of {length} bytes exceeds the maximum"),
                        });
                    }
                }
                other => {
                    return Err(FrameError::Protocol {
                        reason: format!("unexpected byte 0x{other:02x} in frame header"),
                    });
                }
            }
        }
    }

    /// Heartbeats consumed on this connection so far.
    pub(crate) fn heartbeat_count(&self) -> u64 {
        self.heartbeats
    }

    /// Half-closes the write side; read errors after this are expected.
    pub(crate) async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
