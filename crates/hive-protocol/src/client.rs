//! Shared synchronous JSONL IPC client for the daemon's Unix socket.
//!
//! Provides `IpcConnection` for connecting to the Hivemind daemon and sending
//! typed `ClientMessage`/`DaemonMessage` requests. Used by the CLI for
//! one-shot commands; the engine's streaming client lives in hive-engine.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::{ClientMessage, DaemonMessage, ErrorCode};

/// Error from the shared IPC client layer.
#[non_exhaustive]
#[derive(Debug)]
pub enum IpcError {
    /// Daemon socket does not exist or connection was refused.
    NotRunning { path: String },
    /// Socket exists but connection failed for a non-`ConnectionRefused` reason.
    ConnectionFailed(std::io::Error),
    /// Daemon returned an explicit error response.
    DaemonError { code: ErrorCode, message: String },
    /// Protocol-level error (serialization, empty response, invalid JSON).
    ProtocolError { message: String },
    /// Other I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for IpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpcError::NotRunning { path } => {
                write!(f, "Daemon is not running (socket not found at {})", path)
            }
            IpcError::ConnectionFailed(e) => write!(f, "Connection failed: {}", e),
            IpcError::DaemonError { code, message } => {
                write!(f, "Daemon error [{}]: {}", code, message)
            }
            IpcError::ProtocolError { message } => write!(f, "Protocol error: {}", message),
            IpcError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IpcError::ConnectionFailed(e) | IpcError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for IpcError {
    fn from(e: std::io::Error) -> Self {
        IpcError::Io(e)
    }
}

/// RAII guard that restores a Unix socket's read timeout on drop.
struct TimeoutGuard<'a> {
    stream: &'a UnixStream,
    orig_timeout: Option<Duration>,
}

impl Drop for TimeoutGuard<'_> {
    fn drop(&mut self) {
        let _ = self.stream.set_read_timeout(self.orig_timeout);
    }
}

/// A synchronous JSONL connection to the Hivemind daemon.
#[derive(Debug)]
pub struct IpcConnection {
    stream: UnixStream,
}

impl IpcConnection {
    /// Connect to the daemon at the given Unix socket path.
    ///
    /// Checks that the socket file exists, connects, and configures timeouts
    /// (30s read, 5s write). Returns `IpcError::NotRunning` if the socket
    /// doesn't exist or connection is refused.
    pub fn connect(socket_path: &Path) -> Result<Self, IpcError> {
        if !socket_path.exists() {
            return Err(IpcError::NotRunning {
                path: socket_path.display().to_string(),
            });
        }

        let stream = UnixStream::connect(socket_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                IpcError::NotRunning {
                    path: socket_path.display().to_string(),
                }
            } else {
                IpcError::ConnectionFailed(e)
            }
        })?;

        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;

        Ok(Self { stream })
    }

    /// Connect with bounded retries, sleeping `delay` between attempts.
    ///
    /// Used by clients racing a freshly-started daemon whose socket may not
    /// be bound yet.
    pub fn connect_with_retry(
        socket_path: &Path,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, IpcError> {
        let mut last_err = IpcError::NotRunning {
            path: socket_path.display().to_string(),
        };
        for attempt in 0..attempts {
            match Self::connect(socket_path) {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    tracing::debug!(
                        event = "protocol.client.connect_retry",
                        attempt = attempt + 1,
                        attempts = attempts,
                        error = %e,
                    );
                    last_err = e;
                }
            }
            if attempt + 1 < attempts {
                std::thread::sleep(delay);
            }
        }
        Err(last_err)
    }

    /// Send a typed request and read one typed response.
    ///
    /// Serializes `request` as JSON, writes it as a single line, flushes,
    /// then reads response lines until one correlates with the request id.
    /// Streaming messages (`data`, `exit`, `activity`, `connected`) that
    /// arrive in between are skipped — this client is for request/response
    /// use only. Converts `DaemonMessage::Error` into `IpcError::DaemonError`.
    pub fn send(&mut self, request: &ClientMessage) -> Result<DaemonMessage, IpcError> {
        let msg = serde_json::to_string(request).map_err(|e| IpcError::ProtocolError {
            message: e.to_string(),
        })?;

        writeln!(self.stream, "{}", msg)?;
        self.stream.flush()?;

        // Transient BufReader — not stored as a field because the
        // request-response protocol reads whole lines per send(). Storing it
        // would risk buffering data needed by a later streaming reader.
        let mut reader = BufReader::new(&self.stream);
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                return Err(IpcError::ProtocolError {
                    message: "Empty response from daemon".to_string(),
                });
            }

            let response: DaemonMessage =
                serde_json::from_str(line.trim()).map_err(|e| IpcError::ProtocolError {
                    message: format!("Invalid JSON response: {}", e),
                })?;

            // Skip push messages that are not a response to this request.
            if response.response_id() != Some(request.id()) {
                continue;
            }

            if let DaemonMessage::Error { code, message, .. } = response {
                return Err(IpcError::DaemonError { code, message });
            }

            return Ok(response);
        }
    }

    /// Override the read timeout on the underlying socket.
    ///
    /// Callers like `ping` use shorter timeouts than the default 30s.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), IpcError> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }

    /// Check if the connection is still usable (peer hasn't closed).
    ///
    /// Temporarily sets a 1ms read timeout (restored via RAII guard, even on
    /// panic) and attempts a read. Returns `false` if the peer has definitely
    /// closed, `true` otherwise.
    pub fn is_alive(&self) -> bool {
        use std::io::Read;

        let s = &self.stream;
        let orig_timeout = s.read_timeout().ok().flatten();
        let _guard = TimeoutGuard {
            stream: s,
            orig_timeout,
        };

        // Fail-closed: if we can't set the probe timeout, assume broken
        if s.set_read_timeout(Some(Duration::from_millis(1))).is_err() {
            return false;
        }

        let mut buf = [0u8; 1];
        let mut stream_ref = s;
        match stream_ref.read(&mut buf) {
            Ok(0) => false, // EOF — peer closed
            Ok(_) => true,  // Unexpected data but socket alive
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                true
            }
            Err(_) => false,
        }
    }
}
