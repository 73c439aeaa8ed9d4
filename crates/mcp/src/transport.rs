//! Child-process stdio transport.
//!
//! Owns the server's stdin/stdout as the only channel to the peer. The
//! server's stderr is inherited so diagnostics never mix with protocol
//! traffic.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Maximum size of a single incoming line (1MB).
/// Sized for large tool outputs (forecasts, search results).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// How long a server gets to exit on its own after stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Configuration for an MCP server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Per-request timeout; `None` waits until the response or connection loss.
    pub request_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            request_timeout: Some(crate::session::DEFAULT_TIMEOUT),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Line transport over a pipe pair.
pub struct StdioTransport {
    name: String,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<Option<BufReader<BoxedReader>>>,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Spawn the server process with stdin/stdout captured.
    pub fn spawn(config: &ServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let spawn_error = |source| Error::Spawn {
            command: config.command.clone(),
            source,
        };

        let mut process = cmd.spawn().map_err(spawn_error)?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("failed to capture stdin")))?;

        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("failed to capture stdout")))?;

        debug!(server = %config.name, pid = ?process.id(), "spawned server process");

        let mut transport = Self::from_streams(&config.name, stdout, stdin);
        transport.child = Mutex::new(Some(process));
        Ok(transport)
    }

    /// Build a transport over arbitrary streams (no child process).
    pub fn from_streams<R, W>(name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        Self {
            name: name.to_string(),
            child: Mutex::new(None),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(BufReader::new(reader))),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write one encoded line. Concurrent callers are serialized whole-line.
    pub async fn send(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionLost)?;

        let written = async {
            writer.write_all(line.as_bytes()).await?;
            if !line.ends_with('\n') {
                writer.write_all(b"\n").await?;
            }
            writer.flush().await
        }
        .await;

        written.map_err(|e| {
            debug!(server = %self.name, error = %e, "write to server failed");
            Error::ConnectionLost
        })
    }

    /// Read the next line, without its terminator.
    ///
    /// Returns `Ok(None)` once the server's stdout is closed. A trailing
    /// fragment with no terminator is reported as malformed, not dropped.
    pub async fn receive(&self) -> Result<Option<String>> {
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Ok(None);
        };

        let Some(buf) = read_line(reader).await? else {
            return Ok(None);
        };
        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| Error::MalformedMessage("line is not valid UTF-8".into()))
    }

    /// Close both streams and stop the server. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping stdin is the polite shutdown signal.
        self.writer.lock().await.take();

        // A receive in flight holds the reader; it ends on its own at EOF.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }

        let Some(mut process) = self.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(SHUTDOWN_GRACE, process.wait()).await {
            Ok(Ok(status)) => {
                debug!(server = %self.name, %status, "server exited");
            }
            Ok(Err(e)) => {
                warn!(server = %self.name, error = %e, "failed to wait for server");
            }
            Err(_) => {
                debug!(server = %self.name, "server ignored stdin close, killing");
                if let Err(e) = process.kill().await {
                    warn!(server = %self.name, error = %e, "failed to kill server");
                }
            }
        }

        Ok(())
    }
}

/// Read one newline-terminated line, without its terminator.
///
/// At most `MAX_MESSAGE_SIZE` bytes of a line are ever buffered. A longer
/// line is consumed through its newline and discarded, so the stream stays
/// aligned on the next message. Returns `Ok(None)` at a clean EOF.
pub(crate) async fn read_line<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    // One extra byte leaves room for a `\r` before the newline.
    let keep = MAX_MESSAGE_SIZE + 1;
    let mut buf = Vec::new();
    let mut size = 0usize;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if size == 0 {
                return Ok(None);
            }
            return Err(Error::MalformedMessage(format!(
                "stream ended inside a message ({size} bytes without terminator)"
            )));
        }

        let (chunk, terminated) = match available.iter().position(|&b| b == b'\n') {
            Some(end) => (&available[..end], true),
            None => (available, false),
        };
        size += chunk.len();
        if size <= keep {
            buf.extend_from_slice(chunk);
        } else if !buf.is_empty() {
            buf = Vec::new();
        }

        let used = chunk.len() + usize::from(terminated);
        reader.consume(used);
        if terminated {
            break;
        }
    }

    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if size > keep || buf.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(Some(buf))
}
