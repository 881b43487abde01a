//! Local port forwarding: listen on a local address, dial the remote
//! target through the transport for every accepted connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::config::TunnelCfg;
use crate::error::{BoreError, Result};
use crate::stats::Stats;

use super::{pump, PumpDirection, Transport, Tunnel, TunnelCore, TunnelInfo, TunnelStatus};

pub struct LocalTunnel {
    core: TunnelCore,
    transport: Arc<dyn Transport>,
}

impl LocalTunnel {
    pub fn new(name: &str, cfg: TunnelCfg, transport: Arc<dyn Transport>) -> Self {
        Self {
            core: TunnelCore::new(name, cfg),
            transport,
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        cancel: CancellationToken,
        tracker: TaskTracker,
        transport: Arc<dyn Transport>,
        stats: Arc<Stats>,
        remote_host: String,
        remote_port: u16,
        name: String,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(tunnel = %name, "accept loop cancelled");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(tunnel = %name, peer = %peer, "accepted connection");
                            stats.increment_connections();
                            let transport = Arc::clone(&transport);
                            let stats = Arc::clone(&stats);
                            let tracker_inner = tracker.clone();
                            let host = remote_host.clone();
                            let name = name.clone();
                            tracker.spawn(async move {
                                Self::handle_connection(
                                    stream, transport, stats, tracker_inner, host, remote_port, name,
                                )
                                .await;
                            });
                        }
                        Err(e) => {
                            if cancel.is_cancelled() {
                                break;
                            }
                            warn!(tunnel = %name, error = %e, "accept failed");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        local: TcpStream,
        transport: Arc<dyn Transport>,
        stats: Arc<Stats>,
        tracker: TaskTracker,
        remote_host: String,
        remote_port: u16,
        name: String,
    ) {
        let remote = match transport.dial(&remote_host, remote_port).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(tunnel = %name, target = %format!("{}:{}", remote_host, remote_port), error = %e,
                    "dial through transport failed, dropping connection");
                return;
            }
        };

        let (local_read, local_write) = local.into_split();
        let (remote_read, remote_write) = tokio::io::split(remote);

        tracker.spawn(pump(
            local_read,
            remote_write,
            Arc::clone(&stats),
            PumpDirection::Sent,
        ));
        tracker.spawn(pump(remote_read, local_write, stats, PumpDirection::Received));
    }
}

#[async_trait]
impl Tunnel for LocalTunnel {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn cfg(&self) -> &TunnelCfg {
        self.core.cfg()
    }

    async fn start(&self, parent: &CancellationToken) -> Result<()> {
        let cancel = self.core.begin(parent);
        self.core.set_status(TunnelStatus::Connecting, None);

        let cfg = self.core.cfg();
        let addr = format!("{}:{}", cfg.local_host, cfg.local_port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let err = BoreError::BindFailed { addr, source: e };
                self.core.set_status(TunnelStatus::Error, Some(err.to_string()));
                return Err(err);
            }
        };

        // Bound means connected: end-to-end reachability is a property of
        // each incoming connection, not of the tunnel itself.
        self.core.set_status(TunnelStatus::Connected, None);

        self.core.tracker().spawn(Self::accept_loop(
            listener,
            cancel,
            self.core.tracker().clone(),
            Arc::clone(&self.transport),
            self.core.stats(),
            cfg.remote_host.clone(),
            cfg.remote_port,
            self.core.name().to_string(),
        ));

        Ok(())
    }

    async fn stop(&self) {
        self.core.halt().await;
    }

    fn status(&self) -> TunnelStatus {
        self.core.status()
    }

    fn set_status(&self, status: TunnelStatus, error: Option<String>) {
        self.core.set_status(status, error);
    }

    fn set_reconnect_count(&self, count: u32) {
        self.core.set_reconnect_count(count);
    }

    fn info(&self) -> TunnelInfo {
        self.core.info()
    }
}
