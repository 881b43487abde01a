//! Tunnel lifecycle: the shared state machine, the two forwarding
//! variants and the manager that owns them.

mod local;
mod manager;
mod remote;
mod transport;

pub use local::LocalTunnel;
pub use manager::{RunningTunnel, TunnelManager};
pub use remote::RemoteTunnel;
pub use transport::{
    AsyncStream, DisconnectHook, RemoteListener, Transport, TransportFactory, TransportStream,
};

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::TunnelCfg;
use crate::error::Result;
use crate::stats::{Stats, StatsSnapshot};

const PUMP_BUFFER_SIZE: usize = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Stopped,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Stopped => "stopped",
            TunnelStatus::Connecting => "connecting",
            TunnelStatus::Connected => "connected",
            TunnelStatus::Reconnecting => "reconnecting",
            TunnelStatus::Error => "error",
        }
    }
}

/// Runtime snapshot of one tunnel.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub name: String,
    pub cfg: TunnelCfg,
    pub status: TunnelStatus,
    pub error: Option<String>,
    pub stats: StatsSnapshot,
    pub reconnect_count: u32,
    pub last_connected: Option<SystemTime>,
    pub last_errored: Option<SystemTime>,
}

#[async_trait]
pub trait Tunnel: Send + Sync {
    fn name(&self) -> &str;

    fn cfg(&self) -> &TunnelCfg;

    /// Bind the listener and launch the accept loop. Called once per
    /// tunnel object.
    async fn start(&self, parent: &CancellationToken) -> Result<()>;

    /// Cancel the accept loop, close the listener and wait for in-flight
    /// pumps to drain. Idempotent.
    async fn stop(&self);

    fn status(&self) -> TunnelStatus;

    fn set_status(&self, status: TunnelStatus, error: Option<String>);

    /// Seed the reconnect counter when this object replaces a previous
    /// incarnation of the same tunnel.
    fn set_reconnect_count(&self, count: u32);

    fn info(&self) -> TunnelInfo;
}

#[derive(Debug)]
struct TunnelState {
    status: TunnelStatus,
    last_error: Option<String>,
    reconnect_count: u32,
    last_connected: Option<SystemTime>,
    last_errored: Option<SystemTime>,
}

/// State shared by both tunnel variants: identity, counters and the
/// status machine. Status and last_error change together under one lock.
pub(crate) struct TunnelCore {
    name: String,
    cfg: TunnelCfg,
    stats: Arc<Stats>,
    state: Mutex<TunnelState>,
    cancel: Mutex<Option<CancellationToken>>,
    tracker: TaskTracker,
}

impl TunnelCore {
    pub(crate) fn new(name: &str, cfg: TunnelCfg) -> Self {
        Self {
            name: name.to_string(),
            cfg,
            stats: Arc::new(Stats::new()),
            state: Mutex::new(TunnelState {
                status: TunnelStatus::Stopped,
                last_error: None,
                reconnect_count: 0,
                last_connected: None,
                last_errored: None,
            }),
            cancel: Mutex::new(None),
            tracker: TaskTracker::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn cfg(&self) -> &TunnelCfg {
        &self.cfg
    }

    pub(crate) fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub(crate) fn set_status(&self, status: TunnelStatus, error: Option<String>) {
        let mut state = self.state.lock().unwrap();
        state.status = status;
        if let Some(error) = error {
            state.last_error = Some(error);
            state.last_errored = Some(SystemTime::now());
        }
        match status {
            TunnelStatus::Connected => state.last_connected = Some(SystemTime::now()),
            TunnelStatus::Reconnecting => state.reconnect_count += 1,
            _ => {}
        }
    }

    pub(crate) fn status(&self) -> TunnelStatus {
        self.state.lock().unwrap().status
    }

    pub(crate) fn set_reconnect_count(&self, count: u32) {
        self.state.lock().unwrap().reconnect_count = count;
    }

    pub(crate) fn info(&self) -> TunnelInfo {
        let state = self.state.lock().unwrap();
        TunnelInfo {
            name: self.name.clone(),
            cfg: self.cfg.clone(),
            status: state.status,
            error: state.last_error.clone(),
            stats: self.stats.snapshot(),
            reconnect_count: state.reconnect_count,
            last_connected: state.last_connected,
            last_errored: state.last_errored,
        }
    }

    /// Derive and remember the cancellation token for this run.
    pub(crate) fn begin(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        *self.cancel.lock().unwrap() = Some(token.clone());
        token
    }

    /// Cancel the accept loop, wait for every tracked task (accept loop
    /// and pumps) to finish, then mark the tunnel stopped.
    pub(crate) async fn halt(&self) {
        let token = self.cancel.lock().unwrap().clone();
        if let Some(token) = token {
            token.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.set_status(TunnelStatus::Stopped, None);
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PumpDirection {
    Sent,
    Received,
}

/// Copy bytes one way, tallying into the tunnel's stats. EOF or a write
/// failure ends only this direction; the opposite pump runs on.
pub(crate) async fn pump<R, W>(mut from: R, mut to: W, stats: Arc<Stats>, direction: PumpDirection)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        match from.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if to.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                match direction {
                    PumpDirection::Sent => stats.add_sent(n as u64),
                    PumpDirection::Received => stats.add_received(n as u64),
                }
            }
            Err(_) => break,
        }
    }
    let _ = to.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pump_copies_counts_and_stops_at_eof() {
        let data = b"hello tunnel".to_vec();
        let stats = Arc::new(Stats::new());
        let mut out = Vec::new();

        pump(
            std::io::Cursor::new(data.clone()),
            &mut out,
            Arc::clone(&stats),
            PumpDirection::Received,
        )
        .await;

        assert_eq!(out, data);
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_received, data.len() as u64);
        assert_eq!(snap.bytes_sent, 0);
    }

    #[tokio::test]
    async fn pump_ends_when_write_side_is_closed() {
        let (local, mut far) = tokio::io::duplex(8);
        let (_read, write) = tokio::io::split(local);
        far.shutdown().await.unwrap();
        drop(far);

        let stats = Arc::new(Stats::new());
        pump(
            std::io::Cursor::new(vec![0u8; 64]),
            write,
            Arc::clone(&stats),
            PumpDirection::Sent,
        )
        .await;
        // The far end is gone; the pump must terminate rather than spin.
    }

    #[test]
    fn status_machine_stamps_timestamps() {
        let core = TunnelCore::new(
            "t",
            TunnelCfg {
                kind: crate::config::TunnelKind::Local,
                local_host: "localhost".into(),
                local_port: 1,
                remote_host: "localhost".into(),
                remote_port: 2,
            },
        );

        assert_eq!(core.status(), TunnelStatus::Stopped);
        core.set_status(TunnelStatus::Connecting, None);
        core.set_status(TunnelStatus::Connected, None);
        let info = core.info();
        assert!(info.last_connected.is_some());
        assert!(info.last_errored.is_none());

        core.set_status(TunnelStatus::Error, Some("boom".into()));
        let info = core.info();
        assert_eq!(info.error.as_deref(), Some("boom"));
        assert!(info.last_errored.is_some());

        core.set_status(TunnelStatus::Reconnecting, None);
        assert_eq!(core.info().reconnect_count, 1);
        core.set_status(TunnelStatus::Reconnecting, None);
        assert_eq!(core.info().reconnect_count, 2);
    }

    #[test]
    fn reconnect_count_can_be_seeded() {
        let core = TunnelCore::new(
            "t",
            TunnelCfg {
                kind: crate::config::TunnelKind::Local,
                local_host: "localhost".into(),
                local_port: 1,
                remote_host: "localhost".into(),
                remote_port: 2,
            },
        );
        core.set_reconnect_count(4);
        core.set_status(TunnelStatus::Reconnecting, None);
        assert_eq!(core.info().reconnect_count, 5);
    }
}
