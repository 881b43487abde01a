//! Remote port forwarding: the peer listens on our behalf, and every
//! connection it accepts is dialed back to a local target.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::config::TunnelCfg;
use crate::error::Result;
use crate::stats::Stats;

use super::{
    pump, PumpDirection, RemoteListener, Transport, TransportStream, Tunnel, TunnelCore,
    TunnelInfo, TunnelStatus,
};

pub struct RemoteTunnel {
    core: TunnelCore,
    transport: Arc<dyn Transport>,
}

impl RemoteTunnel {
    pub fn new(name: &str, cfg: TunnelCfg, transport: Arc<dyn Transport>) -> Self {
        Self {
            core: TunnelCore::new(name, cfg),
            transport,
        }
    }

    async fn accept_loop(
        mut listener: RemoteListener,
        cancel: CancellationToken,
        tracker: TaskTracker,
        stats: Arc<Stats>,
        local_host: String,
        local_port: u16,
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
                        Some(stream) => {
                            debug!(tunnel = %name, "peer accepted connection");
                            stats.increment_connections();
                            let stats = Arc::clone(&stats);
                            let tracker_inner = tracker.clone();
                            let host = local_host.clone();
                            let name = name.clone();
                            tracker.spawn(async move {
                                Self::handle_connection(stream, stats, tracker_inner, host, local_port, name)
                                    .await;
                            });
                        }
                        // The queue closing means the session is gone; the
                        // disconnect hook takes it from here.
                        None => {
                            debug!(tunnel = %name, "remote listener closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        peer: TransportStream,
        stats: Arc<Stats>,
        tracker: TaskTracker,
        local_host: String,
        local_port: u16,
        name: String,
    ) {
        let local = match TcpStream::connect((local_host.as_str(), local_port)).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(tunnel = %name, target = %format!("{}:{}", local_host, local_port), error = %e,
                    "local dial failed, dropping connection");
                return;
            }
        };

        let (peer_read, peer_write) = tokio::io::split(peer);
        let (local_read, local_write) = local.into_split();

        tracker.spawn(pump(
            peer_read,
            local_write,
            Arc::clone(&stats),
            PumpDirection::Received,
        ));
        tracker.spawn(pump(local_read, peer_write, stats, PumpDirection::Sent));
    }
}

#[async_trait]
impl Tunnel for RemoteTunnel {
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
        let listener = match self.transport.listen("0.0.0.0", cfg.remote_port).await {
            Ok(listener) => listener,
            Err(e) => {
                self.core.set_status(TunnelStatus::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        self.core.set_status(TunnelStatus::Connected, None);

        self.core.tracker().spawn(Self::accept_loop(
            listener,
            cancel,
            self.core.tracker().clone(),
            self.core.stats(),
            cfg.local_host.clone(),
            cfg.local_port,
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
