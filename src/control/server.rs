//! Unix-socket server for the control interface.
//!
//! Each connection carries exactly one newline-delimited JSON request and
//! receives one JSON response. Connections are handled in independent
//! tasks; the injected handler is stateless per request. The socket file
//! is created 0600 and removed again on shutdown.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::protocol::{Request, Response};
use crate::error::{BoreError, Result};

/// Wall-clock limit for one request/response exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// RAII guard that removes the socket path on drop.
struct SocketGuard {
    path: PathBuf,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct ControlServer {
    listener: UnixListener,
    _guard: SocketGuard,
}

impl ControlServer {
    /// Bind the control socket, cleaning up a stale file left behind by
    /// a crashed daemon. Fails if another daemon is listening.
    pub fn bind(path: &Path) -> Result<Self> {
        if !cleanup_stale_socket(path)? {
            return Err(BoreError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("another daemon is listening at {}", path.display()),
            )));
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        info!(path = %path.display(), "control socket bound");
        Ok(Self {
            listener,
            _guard: SocketGuard {
                path: path.to_path_buf(),
            },
        })
    }

    /// Accept connections until `cancel` fires. Consumes the server; the
    /// socket file is removed when the task exits.
    pub fn serve(
        self,
        handler: Arc<dyn RequestHandler>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let _guard = self._guard;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("control server stopping");
                        return;
                    }
                    accepted = self.listener.accept() => {
                        match accepted {
                            Ok((stream, _addr)) => {
                                let handler = Arc::clone(&handler);
                                tokio::spawn(async move {
                                    if let Err(e) = tokio::time::timeout(
                                        EXCHANGE_TIMEOUT,
                                        handle_connection(stream, handler),
                                    )
                                    .await
                                    {
                                        debug!(error = %e, "control exchange timed out");
                                    }
                                });
                            }
                            Err(e) => {
                                if cancel.is_cancelled() {
                                    return;
                                }
                                warn!(error = %e, "control accept failed");
                            }
                        }
                    }
                }
            }
        })
    }
}

async fn handle_connection(stream: UnixStream, handler: Arc<dyn RequestHandler>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let response = match reader.read_line(&mut line).await {
        Ok(0) => Response::error("invalid request: empty frame"),
        Ok(_) => match serde_json::from_str::<Request>(&line) {
            Ok(request) => handler.handle(request).await,
            Err(e) => Response::error(format!("invalid request: {}", e)),
        },
        Err(e) => Response::error(format!("invalid request: {}", e)),
    };

    let mut payload = match serde_json::to_vec(&response) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "failed to encode control response");
            return;
        }
    };
    payload.push(b'\n');

    if let Err(e) = write_half.write_all(&payload).await {
        debug!(error = %e, "failed to write control response");
    }
}

/// Remove a socket file nobody is listening on. Returns false when a
/// live daemon holds it.
fn cleanup_stale_socket(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }

    match StdUnixStream::connect(path) {
        Ok(_) => Ok(false),
        Err(e)
            if e.kind() == std::io::ErrorKind::ConnectionRefused
                || e.kind() == std::io::ErrorKind::NotFound =>
        {
            debug!(path = %path.display(), "removing stale control socket");
            std::fs::remove_file(path)?;
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}
