//! Capabilities tunnels and the manager need from a transport.
//!
//! A local tunnel only needs "open an outbound stream through the session";
//! a remote tunnel only needs "obtain an accept-able listener on the peer".
//! The SSH client provides both, and tests substitute in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{BoreError, Result};

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A bidirectional byte stream obtained through a transport.
pub type TransportStream = Box<dyn AsyncStream>;

/// Invoked at most once per connected lifetime when a transport observes
/// that its session is gone.
pub type DisconnectHook = Arc<dyn Fn(BoreError) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a stream through the session to `host:port`.
    async fn dial(&self, host: &str, port: u16) -> Result<TransportStream>;

    /// Ask the peer to listen on `host:port` and hand back accepted
    /// connections.
    async fn listen(&self, host: &str, port: u16) -> Result<RemoteListener>;

    fn is_connected(&self) -> bool;

    /// Issue one keepalive with a deadline. Failure or timeout fires the
    /// disconnect hook and returns the error.
    async fn check_health(&self, timeout: Duration) -> Result<()>;

    /// At most one subscriber; a new hook displaces the previous one.
    fn set_on_disconnect(&self, hook: DisconnectHook);

    /// Tear the session down. Idempotent.
    async fn close(&self);
}

/// Establishes an authenticated transport to a host alias. The manager
/// consumes this capability; the daemon wires in the SSH implementation.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, alias: &str, cancel: &CancellationToken) -> Result<Arc<dyn Transport>>;
}

/// Peer-side listener: a queue of connections the transport accepted on
/// our behalf, plus a teardown hook that cancels the remote binding.
pub struct RemoteListener {
    rx: mpsc::Receiver<TransportStream>,
    shutdown: Option<Box<dyn FnOnce() + Send>>,
}

impl RemoteListener {
    pub fn new(
        rx: mpsc::Receiver<TransportStream>,
        shutdown: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self { rx, shutdown }
    }

    /// Next peer-accepted connection. `None` means the transport side of
    /// the queue is gone (session closed or binding cancelled).
    pub async fn accept(&mut self) -> Option<TransportStream> {
        self.rx.recv().await
    }
}

impl Drop for RemoteListener {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown();
        }
    }
}
