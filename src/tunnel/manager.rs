//! Ownership of running tunnels and the transport pool.
//!
//! The manager is the single authority on the tunnel map, the transport
//! pool and the tunnel-to-host index. Mutating operations serialize on
//! the inner write lock; read-only views take the read lock. Transports
//! are shared between tunnels on the same host alias and evicted as soon
//! as the last referring tunnel stops or the transport reports loss.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, TunnelKind};
use crate::error::{BoreError, Result};

use super::transport::{DisconnectHook, Transport, TransportFactory};
use super::{LocalTunnel, RemoteTunnel, Tunnel, TunnelInfo, TunnelStatus};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// A tunnel the user intends to be live, together with the host alias it
/// was started against.
#[derive(Debug, Clone)]
pub struct RunningTunnel {
    pub host: String,
    pub info: TunnelInfo,
}

struct Inner {
    tunnels: HashMap<String, Arc<dyn Tunnel>>,
    tunnel_hosts: HashMap<String, String>,
    transports: HashMap<String, Arc<dyn Transport>>,
}

pub struct TunnelManager {
    inner: RwLock<Inner>,
    factory: Arc<dyn TransportFactory>,
    config: Arc<StdRwLock<Config>>,
}

impl TunnelManager {
    pub fn new(config: Arc<StdRwLock<Config>>, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner {
                tunnels: HashMap::new(),
                tunnel_hosts: HashMap::new(),
                transports: HashMap::new(),
            }),
            factory,
            config,
        })
    }

    /// Start a tunnel by name against a host alias.
    ///
    /// Starting an already-running tunnel on the same host is a no-op;
    /// naming a different host stops the old incarnation first, which is
    /// how a tunnel moves between transports.
    pub async fn start_tunnel(
        self: &Arc<Self>,
        name: &str,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;

        if inner.tunnels.contains_key(name) {
            if inner.tunnel_hosts.get(name).map(String::as_str) == Some(host) {
                return Ok(());
            }
            if let Some(tunnel) = inner.tunnels.remove(name) {
                info!(tunnel = %name, new_host = %host, "moving tunnel to a different host");
                tunnel.stop().await;
                inner.tunnel_hosts.remove(name);
                Self::evict_unused(&mut inner).await;
            }
        }

        let cfg = self
            .config
            .read()
            .unwrap()
            .tunnel(name)
            .cloned()
            .ok_or_else(|| BoreError::UnknownTunnel(name.to_string()))?;

        // No two running tunnels may share a local port, regardless of
        // host, kind or current status.
        for (other, tunnel) in &inner.tunnels {
            if tunnel.cfg().local_port == cfg.local_port {
                return Err(BoreError::PortConflict {
                    port: cfg.local_port,
                    incumbent: other.clone(),
                });
            }
        }

        let transport = self
            .get_or_create_transport(&mut inner, host, cancel)
            .await
            .map_err(|e| BoreError::TransportFailed {
                host: host.to_string(),
                source: Box::new(e),
            })?;

        let tunnel: Arc<dyn Tunnel> = match cfg.kind {
            TunnelKind::Local => Arc::new(LocalTunnel::new(name, cfg, Arc::clone(&transport))),
            TunnelKind::Remote => Arc::new(RemoteTunnel::new(name, cfg, Arc::clone(&transport))),
        };

        if let Err(e) = tunnel.start(cancel).await {
            // The transport may have been created just for this tunnel.
            Self::evict_unused(&mut inner).await;
            return Err(e);
        }

        info!(tunnel = %name, host = %host, "tunnel started");
        inner.tunnels.insert(name.to_string(), tunnel);
        inner.tunnel_hosts.insert(name.to_string(), host.to_string());
        Ok(())
    }

    pub async fn stop_tunnel(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;

        let tunnel = inner
            .tunnels
            .remove(name)
            .ok_or_else(|| BoreError::NotRunning(name.to_string()))?;

        tunnel.stop().await;
        inner.tunnel_hosts.remove(name);
        Self::evict_unused(&mut inner).await;

        info!(tunnel = %name, "tunnel stopped");
        Ok(())
    }

    /// Start every tunnel in a group, in list order. Port conflicts are
    /// validated en bloc before anything starts; the first start failure
    /// rolls back everything this call started.
    pub async fn start_group(
        self: &Arc<Self>,
        group: &str,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (names, tunnel_cfgs) = {
            let config = self.config.read().unwrap();
            let names = config.group_tunnels(group)?;
            let cfgs: HashMap<String, _> = names
                .iter()
                .filter_map(|n| config.tunnel(n).cloned().map(|c| (n.clone(), c)))
                .collect();
            (names, cfgs)
        };

        {
            let inner = self.inner.read().await;
            let mut group_ports: HashMap<u16, &str> = HashMap::new();
            for name in &names {
                if inner.tunnels.contains_key(name) {
                    continue;
                }
                let cfg = tunnel_cfgs
                    .get(name)
                    .ok_or_else(|| BoreError::UnknownTunnel(name.clone()))?;

                for (running, tunnel) in &inner.tunnels {
                    if tunnel.cfg().local_port == cfg.local_port {
                        return Err(BoreError::PortConflict {
                            port: cfg.local_port,
                            incumbent: running.clone(),
                        });
                    }
                }
                if let Some(previous) = group_ports.insert(cfg.local_port, name.as_str()) {
                    return Err(BoreError::PortConflict {
                        port: cfg.local_port,
                        incumbent: previous.to_string(),
                    });
                }
            }
        }

        let mut started: Vec<String> = Vec::new();
        for name in &names {
            if let Err(e) = self.start_tunnel(name, host, cancel).await {
                warn!(group = %group, tunnel = %name, error = %e, "group start failed, rolling back");
                for name in &started {
                    if let Err(stop_err) = self.stop_tunnel(name).await {
                        warn!(tunnel = %name, error = %stop_err, "rollback stop failed");
                    }
                }
                return Err(e);
            }
            started.push(name.clone());
        }

        info!(group = %group, host = %host, tunnels = started.len(), "group started");
        Ok(())
    }

    /// Stop every tunnel in a group, collecting errors; the last one (if
    /// any) is returned.
    pub async fn stop_group(&self, group: &str) -> Result<()> {
        let names = self.config.read().unwrap().group_tunnels(group)?;

        let mut last_err = None;
        for name in &names {
            if let Err(e) = self.stop_tunnel(name).await {
                last_err = Some(e);
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear a tunnel down and rebuild it on a fresh transport.
    ///
    /// The old transport is evicted unconditionally so the factory
    /// establishes a new session. On failure the replacement object stays
    /// in the map with status error so observers can see it.
    pub async fn reconnect_tunnel(
        self: &Arc<Self>,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;

        let tunnel = inner
            .tunnels
            .get(name)
            .cloned()
            .ok_or_else(|| BoreError::NotRunning(name.to_string()))?;
        let host = inner
            .tunnel_hosts
            .get(name)
            .cloned()
            .ok_or_else(|| BoreError::NotRunning(name.to_string()))?;

        let previous = tunnel.info();
        tunnel.stop().await;

        if let Some(old) = inner.transports.remove(&host) {
            old.close().await;
        }

        let transport = match self.get_or_create_transport(&mut inner, &host, cancel).await {
            Ok(transport) => transport,
            Err(e) => {
                let err = BoreError::TransportFailed {
                    host: host.clone(),
                    source: Box::new(e),
                };
                tunnel.set_status(TunnelStatus::Error, Some(err.to_string()));
                return Err(err);
            }
        };

        let cfg = previous.cfg.clone();
        let replacement: Arc<dyn Tunnel> = match cfg.kind {
            TunnelKind::Local => Arc::new(LocalTunnel::new(name, cfg, Arc::clone(&transport))),
            TunnelKind::Remote => Arc::new(RemoteTunnel::new(name, cfg, Arc::clone(&transport))),
        };
        replacement.set_reconnect_count(previous.reconnect_count);
        replacement.set_status(TunnelStatus::Reconnecting, None);

        let result = replacement.start(cancel).await;
        inner.tunnels.insert(name.to_string(), replacement);
        if let Err(e) = &result {
            debug!(tunnel = %name, error = %e, "reconnect attempt failed");
        }
        result
    }

    /// Health-check every pooled transport concurrently. Failures fire
    /// the transport's disconnect hook, which marks the affected tunnels
    /// and evicts the transport.
    pub async fn check_health(&self) {
        let transports: Vec<(String, Arc<dyn Transport>)> = {
            let inner = self.inner.read().await;
            inner
                .transports
                .iter()
                .map(|(alias, t)| (alias.clone(), Arc::clone(t)))
                .collect()
        };

        if transports.is_empty() {
            return;
        }

        let mut checks = JoinSet::new();
        for (alias, transport) in transports {
            checks.spawn(async move {
                if let Err(e) = transport.check_health(HEALTH_CHECK_TIMEOUT).await {
                    debug!(host = %alias, error = %e, "health check failed");
                }
            });
        }
        while checks.join_next().await.is_some() {}
    }

    pub async fn get_info(&self, name: &str) -> Option<RunningTunnel> {
        let inner = self.inner.read().await;
        let tunnel = inner.tunnels.get(name)?;
        Some(RunningTunnel {
            host: inner.tunnel_hosts.get(name).cloned().unwrap_or_default(),
            info: tunnel.info(),
        })
    }

    pub async fn list_running(&self) -> Vec<String> {
        self.inner.read().await.tunnels.keys().cloned().collect()
    }

    pub async fn all_info(&self) -> Vec<RunningTunnel> {
        let inner = self.inner.read().await;
        inner
            .tunnels
            .iter()
            .map(|(name, tunnel)| RunningTunnel {
                host: inner.tunnel_hosts.get(name).cloned().unwrap_or_default(),
                info: tunnel.info(),
            })
            .collect()
    }

    /// Number of pooled transports. Diagnostics and tests only.
    pub async fn transport_count(&self) -> usize {
        self.inner.read().await.transports.len()
    }

    pub async fn stop_all(&self) {
        let mut inner = self.inner.write().await;

        for (name, tunnel) in inner.tunnels.drain() {
            debug!(tunnel = %name, "stopping");
            tunnel.stop().await;
        }
        inner.tunnel_hosts.clear();

        for (_, transport) in inner.transports.drain() {
            transport.close().await;
        }
    }

    async fn get_or_create_transport(
        self: &Arc<Self>,
        inner: &mut Inner,
        alias: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Transport>> {
        if let Some(existing) = inner.transports.get(alias) {
            if existing.is_connected() {
                return Ok(Arc::clone(existing));
            }
        }
        if let Some(stale) = inner.transports.remove(alias) {
            stale.close().await;
        }

        let transport = self.factory.connect(alias, cancel).await?;
        transport.set_on_disconnect(self.disconnect_hook(alias));
        inner.transports.insert(alias.to_string(), Arc::clone(&transport));
        Ok(transport)
    }

    /// The hook runs in its own task and re-acquires the manager lock
    /// there; the transport must never invoke it while we hold the lock.
    fn disconnect_hook(self: &Arc<Self>, alias: &str) -> DisconnectHook {
        let manager: Weak<TunnelManager> = Arc::downgrade(self);
        let alias = alias.to_string();
        Arc::new(move |err| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let alias = alias.clone();
            tokio::spawn(async move {
                manager.on_transport_disconnect(&alias, err).await;
            });
        })
    }

    async fn on_transport_disconnect(&self, alias: &str, err: BoreError) {
        warn!(host = %alias, error = %err, "transport disconnected");
        let mut inner = self.inner.write().await;

        for (name, tunnel) in &inner.tunnels {
            if inner.tunnel_hosts.get(name).map(String::as_str) == Some(alias) {
                tunnel.set_status(
                    TunnelStatus::Error,
                    Some(format!("SSH connection lost: {}", err)),
                );
            }
        }

        if let Some(transport) = inner.transports.remove(alias) {
            transport.close().await;
        }
    }

    async fn evict_unused(inner: &mut Inner) {
        let used: HashSet<&String> = inner.tunnel_hosts.values().collect();
        let stale: Vec<String> = inner
            .transports
            .keys()
            .filter(|alias| !used.contains(alias))
            .cloned()
            .collect();

        for alias in stale {
            if let Some(transport) = inner.transports.remove(&alias) {
                debug!(host = %alias, "evicting unused transport");
                transport.close().await;
            }
        }
    }
}
