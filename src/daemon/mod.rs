//! The daemon: wires the manager, control server, network monitor and
//! state store together, owns the root cancellation token, and restores
//! the persisted running set on startup.

pub mod process;

use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::Config;
use crate::control::protocol::{
    GroupStatus, NetworkStatusInfo, StatusResponse, TunnelStatusInfo, REQ_GROUP_DISABLE,
    REQ_GROUP_ENABLE, REQ_PING, REQ_RELOAD_CONFIG, REQ_STATUS, REQ_STOP, REQ_TUNNEL_DOWN,
    REQ_TUNNEL_UP,
};
use crate::control::{ControlServer, Request, RequestData, RequestHandler, Response};
use crate::error::{BoreError, Result};
use crate::netmon::{NetStatus, NetworkMonitor};
use crate::paths::Paths;
use crate::ssh::SshTransportFactory;
use crate::state::StateStore;
use crate::tunnel::{TransportFactory, TunnelManager, TunnelStatus};

pub struct Daemon {
    config: Arc<StdRwLock<Config>>,
    manager: Arc<TunnelManager>,
    state: Arc<StateStore>,
    monitor: Arc<NetworkMonitor>,
    root: CancellationToken,
    paths: Paths,
}

impl Daemon {
    pub fn new(paths: Paths) -> Result<Arc<Self>> {
        let config = Arc::new(StdRwLock::new(Config::load_from(&paths.config())?));
        let factory = Arc::new(SshTransportFactory::new(Arc::clone(&config)));
        Ok(Self::with_parts(paths, config, factory, NetworkMonitor::new()))
    }

    /// Assemble a daemon from explicit parts. Tests inject stub transport
    /// factories and scripted network monitors here.
    pub fn with_parts(
        paths: Paths,
        config: Arc<StdRwLock<Config>>,
        factory: Arc<dyn TransportFactory>,
        monitor: Arc<NetworkMonitor>,
    ) -> Arc<Self> {
        let manager = TunnelManager::new(Arc::clone(&config), factory);
        let state = Arc::new(StateStore::new(paths.state()));
        Arc::new(Self {
            config,
            manager,
            state,
            monitor,
            root: CancellationToken::new(),
            paths,
        })
    }

    pub fn manager(&self) -> &Arc<TunnelManager> {
        &self.manager
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    /// Main loop: fatal on PID-file or socket-bind failure, otherwise
    /// runs until a signal or a control `stop` arrives.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        process::write_pid(&self.paths)?;

        let server = match ControlServer::bind(&self.paths.socket()) {
            Ok(server) => server,
            Err(e) => {
                process::remove_pid(&self.paths);
                return Err(e);
            }
        };
        let handler: Arc<dyn RequestHandler> = Arc::clone(&self) as Arc<dyn RequestHandler>;
        let server_task = server.serve(handler, self.root.child_token());

        self.monitor.start();
        {
            let daemon = Arc::downgrade(&self);
            self.monitor.subscribe(move |status| {
                if status != NetStatus::Available {
                    debug!("network unavailable");
                    return;
                }
                if let Some(daemon) = daemon.upgrade() {
                    info!("network restored, reconnecting errored tunnels");
                    daemon.spawn_reconnect_sweep();
                }
            });
        }

        self.restore_state().await;
        self.spawn_health_sweep();

        info!(pid = std::process::id(), "daemon started");

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
            _ = self.root.cancelled() => info!("shutdown requested via control socket"),
        }

        self.shutdown().await;
        let _ = server_task.await;
        Ok(())
    }

    async fn shutdown(&self) {
        self.root.cancel();

        if let Err(e) = self.state.save() {
            warn!(error = %e, "failed to persist state during shutdown");
        }

        self.manager.stop_all().await;
        self.monitor.stop();
        process::remove_pid(&self.paths);
        info!("daemon stopped");
    }

    /// Replay the persisted running set: groups first (they cover several
    /// tunnels), then individual tunnels. A failed replay is logged and
    /// skipped; it never brings the daemon down.
    pub async fn restore_state(&self) {
        if let Err(e) = self.state.load() {
            warn!(error = %e, "failed to load persisted state");
            return;
        }

        for entry in self.state.groups() {
            match self.manager.start_group(&entry.name, &entry.host, &self.root).await {
                Ok(()) => info!(group = %entry.name, host = %entry.host, "restored group"),
                Err(e) => warn!(group = %entry.name, error = %e, "failed to restore group"),
            }
        }

        for entry in self.state.tunnels() {
            match self.manager.start_tunnel(&entry.name, &entry.host, &self.root).await {
                Ok(()) => info!(tunnel = %entry.name, host = %entry.host, "restored tunnel"),
                Err(e) => warn!(tunnel = %entry.name, error = %e, "failed to restore tunnel"),
            }
        }
    }

    /// Probe every pooled transport periodically so a silently dead
    /// session is noticed even without traffic.
    fn spawn_health_sweep(self: &Arc<Self>) {
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = daemon.root.cancelled() => return,
                    _ = ticker.tick() => daemon.manager.check_health().await,
                }
            }
        });
    }

    /// Kick off one reconnection task per tunnel currently in error.
    pub fn spawn_reconnect_sweep(self: &Arc<Self>) {
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            for running in daemon.manager.all_info().await {
                if matches!(
                    running.info.status,
                    TunnelStatus::Error | TunnelStatus::Reconnecting
                ) {
                    daemon.spawn_reconnect(running.info.name.clone());
                }
            }
        });
    }

    /// One tunnel's recovery loop: wait out network loss, try, back off,
    /// repeat. Exits on success or root cancellation.
    fn spawn_reconnect(self: &Arc<Self>, name: String) {
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            let reconnect = daemon.config.read().unwrap().defaults.reconnect.clone();
            if !reconnect.enabled {
                return;
            }
            let mut backoff = Backoff::new(
                Duration::from_secs(reconnect.initial_backoff_secs),
                Duration::from_secs(reconnect.max_backoff_secs),
                reconnect.multiplier,
            );

            loop {
                if daemon.root.is_cancelled() {
                    return;
                }

                if !daemon.monitor.is_available() {
                    if daemon.monitor.wait_for_available(&daemon.root).await.is_err() {
                        return;
                    }
                    backoff.reset();
                }

                let manager = Arc::clone(&daemon.manager);
                match manager.reconnect_tunnel(&name, &daemon.root).await {
                    Ok(()) => {
                        info!(tunnel = %name, "reconnected");
                        return;
                    }
                    Err(e) => {
                        warn!(tunnel = %name, error = %e, "reconnect failed");
                        let delay = backoff.next();
                        debug!(tunnel = %name, delay = ?delay, "retrying after backoff");
                        tokio::select! {
                            _ = daemon.root.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        });
    }

    async fn handle_status(&self) -> Response {
        let running = self.manager.all_info().await;

        let mut tunnels: Vec<TunnelStatusInfo> = running
            .iter()
            .map(|r| TunnelStatusInfo {
                name: r.info.name.clone(),
                kind: r.info.cfg.kind.to_string(),
                host: r.host.clone(),
                local_port: r.info.cfg.local_port,
                remote_host: r.info.cfg.remote_host.clone(),
                remote_port: r.info.cfg.remote_port,
                status: r.info.status.as_str().to_string(),
                error: r.info.error.clone(),
                bytes_sent: r.info.stats.bytes_sent,
                bytes_received: r.info.stats.bytes_received,
                connections: r.info.stats.connections,
                reconnect_count: r.info.reconnect_count,
                uptime: Some(format_duration(r.info.stats.uptime)),
            })
            .collect();
        tunnels.sort_by(|a, b| a.name.cmp(&b.name));

        let running_names: std::collections::HashSet<&str> =
            running.iter().map(|r| r.info.name.as_str()).collect();

        let mut groups: Vec<GroupStatus> = {
            let config = self.config.read().unwrap();
            config
                .groups
                .iter()
                .map(|(name, group)| GroupStatus {
                    name: name.clone(),
                    description: group.description.clone(),
                    enabled: group
                        .tunnels
                        .iter()
                        .all(|t| running_names.contains(t.as_str())),
                    tunnels: group.tunnels.clone(),
                })
                .collect()
        };
        groups.sort_by(|a, b| a.name.cmp(&b.name));

        Response::ok_with(&StatusResponse {
            running: true,
            pid: std::process::id(),
            uptime: format_duration(self.state.uptime()),
            tunnels,
            groups,
            network: NetworkStatusInfo {
                status: self.monitor.status().as_str().to_string(),
            },
        })
    }

    fn require_host(data: Option<RequestData>) -> std::result::Result<(String, String), Response> {
        let Some(data) = data else {
            return Err(Response::error("invalid request: missing data"));
        };
        match data.host.as_deref() {
            Some(host) if !host.is_empty() => Ok((data.name, host.to_string())),
            _ => Err(Response::error(BoreError::HostRequired.to_string())),
        }
    }

    fn require_name(data: Option<RequestData>) -> std::result::Result<String, Response> {
        match data {
            Some(data) => Ok(data.name),
            None => Err(Response::error("invalid request: missing data")),
        }
    }

    fn persist(&self) {
        if let Err(e) = self.state.save() {
            warn!(error = %e, "failed to persist state");
        }
    }

    async fn handle_tunnel_up(&self, data: Option<RequestData>) -> Response {
        let (name, host) = match Self::require_host(data) {
            Ok(parts) => parts,
            Err(resp) => return resp,
        };

        if let Err(e) = self.manager.start_tunnel(&name, &host, &self.root).await {
            return Response::error(e.to_string());
        }

        self.state.add_tunnel(&name, &host);
        self.persist();
        Response::ok()
    }

    async fn handle_tunnel_down(&self, data: Option<RequestData>) -> Response {
        let name = match Self::require_name(data) {
            Ok(name) => name,
            Err(resp) => return resp,
        };

        if let Err(e) = self.manager.stop_tunnel(&name).await {
            return Response::error(e.to_string());
        }

        self.state.remove_tunnel(&name);
        self.persist();
        Response::ok()
    }

    async fn handle_group_enable(&self, data: Option<RequestData>) -> Response {
        let (name, host) = match Self::require_host(data) {
            Ok(parts) => parts,
            Err(resp) => return resp,
        };

        if let Err(e) = self.manager.start_group(&name, &host, &self.root).await {
            return Response::error(e.to_string());
        }

        self.state.add_group(&name, &host);
        self.persist();
        Response::ok()
    }

    async fn handle_group_disable(&self, data: Option<RequestData>) -> Response {
        let name = match Self::require_name(data) {
            Ok(name) => name,
            Err(resp) => return resp,
        };

        // Disabling always withdraws the intent, even when some tunnels
        // were already down.
        let result = self.manager.stop_group(&name).await;
        self.state.remove_group(&name);
        self.persist();

        match result {
            Ok(()) => Response::ok(),
            Err(e) => Response::error(e.to_string()),
        }
    }

    fn handle_reload_config(&self) -> Response {
        match Config::load_from(&self.paths.config()) {
            Ok(new_config) => {
                *self.config.write().unwrap() = new_config;
                info!("configuration reloaded");
                Response::ok()
            }
            Err(e) => Response::error(format!("failed to reload config: {}", e)),
        }
    }
}

#[async_trait]
impl RequestHandler for Daemon {
    async fn handle(&self, request: Request) -> Response {
        match request.kind.as_str() {
            REQ_PING => Response::ok(),
            REQ_STATUS => self.handle_status().await,
            REQ_STOP => {
                // Acknowledge first, then cancel so the response makes it
                // out before the socket goes away.
                let root = self.root.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    root.cancel();
                });
                Response::ok()
            }
            REQ_TUNNEL_UP => self.handle_tunnel_up(request.data).await,
            REQ_TUNNEL_DOWN => self.handle_tunnel_down(request.data).await,
            REQ_GROUP_ENABLE => self.handle_group_enable(request.data).await,
            REQ_GROUP_DISABLE => self.handle_group_disable(request.data).await,
            REQ_RELOAD_CONFIG => self.handle_reload_config(),
            other => Response::error(format!("unknown request type: {}", other)),
        }
    }
}

/// Render a duration the way humans read uptimes: "2h3m10s".
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
