//! The SSH transport: one authenticated, keepalive-maintained session to
//! one host, shared by every tunnel bound to that host alias.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{BoreError, Result};
use crate::ssh_config::{resolve_host, resolve_proxy_host, ResolvedHost, SshConfigReader};
use crate::tunnel::{
    DisconnectHook, RemoteListener, Transport, TransportFactory, TransportStream,
};

use super::auth;
use super::handler::{ClientHandler, ForwardRoutes};

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const FORWARD_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub keepalive_interval: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

type SharedHandle = Arc<TokioMutex<Handle<ClientHandler>>>;

pub struct SshTransport {
    host: ResolvedHost,
    settings: TransportSettings,
    handle: StdRwLock<Option<SharedHandle>>,
    // Kept alive for the whole session when connecting through a jump
    // host; the tunneled stream dies with it.
    proxy_handle: Mutex<Option<Arc<Handle<ClientHandler>>>>,
    routes: ForwardRoutes,
    on_disconnect: Mutex<Option<DisconnectHook>>,
    disconnect_fired: AtomicBool,
    keepalive_cancel: Mutex<Option<CancellationToken>>,
}

impl SshTransport {
    pub async fn connect(
        host: ResolvedHost,
        settings: TransportSettings,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let transport = Arc::new(Self {
            host,
            settings,
            handle: StdRwLock::new(None),
            proxy_handle: Mutex::new(None),
            routes: Arc::new(Mutex::new(HashMap::new())),
            on_disconnect: Mutex::new(None),
            disconnect_fired: AtomicBool::new(false),
            keepalive_cancel: Mutex::new(None),
        });

        let handle = transport.establish(cancel).await?;
        *transport.handle.write().unwrap() = Some(Arc::new(TokioMutex::new(handle)));
        transport.spawn_keepalive();

        info!(
            host = %transport.host.alias,
            addr = %format!("{}:{}", transport.host.hostname, transport.host.port),
            user = %transport.host.user,
            "SSH session established"
        );
        Ok(transport)
    }

    fn russh_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            // Must outlast the keepalive cadence.
            inactivity_timeout: Some(self.settings.keepalive_interval * 2),
            keepalive_interval: Some(self.settings.keepalive_interval),
            keepalive_max: 3,
            ..Default::default()
        })
    }

    async fn establish(&self, cancel: &CancellationToken) -> Result<Handle<ClientHandler>> {
        let config = self.russh_config();

        let mut handle = match self.host.proxy_jump.clone() {
            Some(proxy_alias) => self.connect_via_proxy(&proxy_alias, config, cancel).await?,
            None => {
                let addr = format!("{}:{}", self.host.hostname, self.host.port);
                let stream = dial_tcp(&addr, cancel).await?;
                client::connect_stream(config, stream, ClientHandler::new(Arc::clone(&self.routes)))
                    .await
                    .map_err(|e| BoreError::HandshakeFailed(e.to_string()))?
            }
        };

        auth::authenticate(
            &mut handle,
            &self.host.user,
            self.host.identity_file.as_deref(),
        )
        .await?;

        Ok(handle)
    }

    /// One jump hop: authenticate to the proxy, open a stream to the
    /// target through it, and run the target handshake over that stream.
    async fn connect_via_proxy(
        &self,
        proxy_alias: &str,
        config: Arc<client::Config>,
        cancel: &CancellationToken,
    ) -> Result<Handle<ClientHandler>> {
        let reader = SshConfigReader::new();
        let proxy = resolve_proxy_host(proxy_alias, &reader, &self.host.user);
        let proxy_addr = format!("{}:{}", proxy.hostname, proxy.port);

        let unreachable = |message: String| BoreError::ProxyUnreachable {
            proxy: proxy_alias.to_string(),
            message,
        };

        let stream = dial_tcp(&proxy_addr, cancel)
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        // The proxy session routes no forwarded channels of its own.
        let proxy_routes: ForwardRoutes = Arc::new(Mutex::new(HashMap::new()));
        let mut proxy_handle =
            client::connect_stream(Arc::clone(&config), stream, ClientHandler::new(proxy_routes))
                .await
                .map_err(|e| unreachable(e.to_string()))?;

        auth::authenticate(&mut proxy_handle, &proxy.user, proxy.identity_file.as_deref())
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        debug!(proxy = %proxy_alias, target = %self.host.alias, "dialing target through proxy");
        let channel = proxy_handle
            .channel_open_direct_tcpip(
                self.host.hostname.as_str(),
                self.host.port as u32,
                "127.0.0.1",
                0,
            )
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        *self.proxy_handle.lock().unwrap() = Some(Arc::new(proxy_handle));

        client::connect_stream(
            config,
            channel.into_stream(),
            ClientHandler::new(Arc::clone(&self.routes)),
        )
        .await
        .map_err(|e| BoreError::HandshakeFailed(e.to_string()))
    }

    fn current_handle(&self) -> Option<SharedHandle> {
        self.handle.read().unwrap().clone()
    }

    fn spawn_keepalive(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        *self.keepalive_cancel.lock().unwrap() = Some(cancel.clone());

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(transport.settings.keepalive_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let Some(handle) = transport.current_handle() else { return };
                        let result = handle.lock().await.channel_open_session().await;
                        match result {
                            Ok(channel) => drop(channel),
                            Err(e) => {
                                transport.fire_disconnect(BoreError::KeepaliveFailed(e.to_string()));
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    fn fire_disconnect(&self, err: BoreError) {
        if self.disconnect_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = self.on_disconnect.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(err);
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn dial(&self, host: &str, port: u16) -> Result<TransportStream> {
        let handle = self.current_handle().ok_or(BoreError::NotConnected)?;
        let channel = handle
            .lock()
            .await
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn listen(&self, host: &str, port: u16) -> Result<RemoteListener> {
        let handle = self.current_handle().ok_or(BoreError::NotConnected)?;

        handle
            .lock()
            .await
            .tcpip_forward(host, port as u32)
            .await
            .map_err(|e| BoreError::RemoteBindFailed {
                addr: format!("{}:{}", host, port),
                message: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(FORWARD_QUEUE_DEPTH);
        self.routes.lock().unwrap().insert(port as u32, tx);

        let routes = Arc::clone(&self.routes);
        let cancel_handle = Arc::clone(&handle);
        let cancel_host = host.to_string();
        let shutdown = Box::new(move || {
            routes.lock().unwrap().remove(&(port as u32));
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    let _ = cancel_handle
                        .lock()
                        .await
                        .cancel_tcpip_forward(cancel_host.as_str(), port as u32)
                        .await;
                });
            }
        });

        Ok(RemoteListener::new(rx, Some(shutdown)))
    }

    fn is_connected(&self) -> bool {
        self.handle.read().unwrap().is_some()
    }

    async fn check_health(&self, timeout: Duration) -> Result<()> {
        let handle = self.current_handle().ok_or(BoreError::NotConnected)?;

        match tokio::time::timeout(timeout, async { handle.lock().await.channel_open_session().await }).await {
            Ok(Ok(channel)) => {
                drop(channel);
                Ok(())
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                self.fire_disconnect(BoreError::KeepaliveFailed(message.clone()));
                Err(BoreError::KeepaliveFailed(message))
            }
            Err(_) => {
                self.fire_disconnect(BoreError::KeepaliveFailed("timed out".to_string()));
                Err(BoreError::KeepaliveFailed("timed out".to_string()))
            }
        }
    }

    fn set_on_disconnect(&self, hook: DisconnectHook) {
        *self.on_disconnect.lock().unwrap() = Some(hook);
    }

    async fn close(&self) {
        // A deliberate close never notifies the disconnect hook.
        self.disconnect_fired.store(true, Ordering::SeqCst);

        let keepalive = self.keepalive_cancel.lock().unwrap().take();
        if let Some(keepalive) = keepalive {
            keepalive.cancel();
        }

        let handle = self.handle.write().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle
                .lock()
                .await
                .disconnect(russh::Disconnect::ByApplication, "shutting down", "en")
                .await;
        }

        self.proxy_handle.lock().unwrap().take();
    }
}

async fn dial_tcp(addr: &str, cancel: &CancellationToken) -> Result<TcpStream> {
    tokio::select! {
        _ = cancel.cancelled() => Err(BoreError::Cancelled),
        attempt = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)) => match attempt {
            Err(_) => Err(BoreError::DialTimeout(addr.to_string())),
            Ok(Err(e)) => Err(BoreError::HandshakeFailed(format!(
                "failed to connect to {}: {}", addr, e
            ))),
            Ok(Ok(stream)) => Ok(stream),
        }
    }
}

/// Connects SSH transports for the manager, resolving each alias against
/// the current configuration and the user's SSH config at connect time.
pub struct SshTransportFactory {
    config: Arc<StdRwLock<Config>>,
}

impl SshTransportFactory {
    pub fn new(config: Arc<StdRwLock<Config>>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for SshTransportFactory {
    async fn connect(&self, alias: &str, cancel: &CancellationToken) -> Result<Arc<dyn Transport>> {
        let (entry, interval_secs) = {
            let config = self.config.read().unwrap();
            (
                config.host(alias).cloned(),
                config.defaults.keep_alive.interval_secs,
            )
        };

        let settings = TransportSettings {
            keepalive_interval: Duration::from_secs(if interval_secs == 0 {
                30
            } else {
                interval_secs
            }),
        };

        let reader = SshConfigReader::new();
        let resolved = resolve_host(alias, entry.as_ref(), &reader);

        let transport = SshTransport::connect(resolved, settings, cancel).await?;
        Ok(transport as Arc<dyn Transport>)
    }
}
