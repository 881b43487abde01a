//! Shared test fixtures: in-memory stub transports and config builders.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bore::config::{Config, GroupCfg, TunnelCfg, TunnelKind};
use bore::error::{BoreError, Result};
use bore::tunnel::{
    DisconnectHook, RemoteListener, Transport, TransportFactory, TransportStream,
};

const STUB_PIPE_CAPACITY: usize = 4 * 1024 * 1024;

/// In-memory transport: `dial` hands back one side of a duplex pipe with
/// an echo task on the other side; `listen` hands back a queue the test
/// feeds directly.
pub struct StubTransport {
    connected: AtomicBool,
    healthy: AtomicBool,
    dial_fails: AtomicBool,
    hook: Mutex<Option<DisconnectHook>>,
    hook_fired: AtomicBool,
    routes: Arc<Mutex<HashMap<u16, mpsc::Sender<TransportStream>>>>,
    pub dials: AtomicUsize,
}

impl StubTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
            dial_fails: AtomicBool::new(false),
            hook: Mutex::new(None),
            hook_fired: AtomicBool::new(false),
            routes: Arc::new(Mutex::new(HashMap::new())),
            dials: AtomicUsize::new(0),
        })
    }

    /// Make future dials fail, as if the target were unreachable.
    pub fn refuse_dials(&self) {
        self.dial_fails.store(true, Ordering::SeqCst);
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    /// Simulate the session dropping: fires the disconnect hook exactly
    /// once, like a failed keepalive would.
    pub fn fire_disconnect(&self, message: &str) {
        if self.hook_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = self.hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(BoreError::KeepaliveFailed(message.to_string()));
        }
    }

    /// Inject a peer-accepted connection into a remote listener.
    pub async fn push_remote_conn(&self, port: u16, stream: TransportStream) {
        let tx = self
            .routes
            .lock()
            .unwrap()
            .get(&port)
            .cloned()
            .expect("no remote listener registered for port");
        tx.send(stream).await.expect("remote listener gone");
    }

    pub fn is_closed(&self) -> bool {
        !self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn dial(&self, _host: &str, _port: u16) -> Result<TransportStream> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BoreError::NotConnected);
        }
        if self.dial_fails.load(Ordering::SeqCst) {
            return Err(BoreError::HandshakeFailed("stub target unreachable".into()));
        }
        self.dials.fetch_add(1, Ordering::SeqCst);

        let (near, far) = tokio::io::duplex(STUB_PIPE_CAPACITY);
        tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut read, &mut write).await;
            let _ = write.shutdown().await;
        });
        Ok(Box::new(near))
    }

    async fn listen(&self, _host: &str, port: u16) -> Result<RemoteListener> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BoreError::NotConnected);
        }
        let (tx, rx) = mpsc::channel(16);
        self.routes.lock().unwrap().insert(port, tx);

        let routes = Arc::clone(&self.routes);
        let shutdown = Box::new(move || {
            routes.lock().unwrap().remove(&port);
        });
        Ok(RemoteListener::new(rx, Some(shutdown)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn check_health(&self, _timeout: Duration) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            self.fire_disconnect("health probe failed");
            Err(BoreError::KeepaliveFailed("health probe failed".into()))
        }
    }

    fn set_on_disconnect(&self, hook: DisconnectHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.hook_fired.store(true, Ordering::SeqCst);
    }
}

/// Factory that records every transport it creates and can be told to
/// refuse particular aliases.
pub struct StubFactory {
    pub created: Mutex<Vec<(String, Arc<StubTransport>)>>,
    pub refuse: Mutex<HashSet<String>>,
}

impl StubFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
            refuse: Mutex::new(HashSet::new()),
        })
    }

    pub fn refuse_alias(&self, alias: &str) {
        self.refuse.lock().unwrap().insert(alias.to_string());
    }

    pub fn allow_alias(&self, alias: &str) {
        self.refuse.lock().unwrap().remove(alias);
    }

    pub fn connect_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// The most recently created transport for an alias.
    pub fn latest(&self, alias: &str) -> Option<Arc<StubTransport>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(a, _)| a == alias)
            .map(|(_, t)| Arc::clone(t))
    }
}

#[async_trait]
impl TransportFactory for StubFactory {
    async fn connect(&self, alias: &str, _cancel: &CancellationToken) -> Result<Arc<dyn Transport>> {
        if self.refuse.lock().unwrap().contains(alias) {
            return Err(BoreError::HandshakeFailed(format!(
                "stub refused connection to '{}'",
                alias
            )));
        }
        let transport = StubTransport::new();
        self.created
            .lock()
            .unwrap()
            .push((alias.to_string(), Arc::clone(&transport)));
        Ok(transport as Arc<dyn Transport>)
    }
}

pub fn local_tunnel(local_port: u16, remote_host: &str, remote_port: u16) -> TunnelCfg {
    TunnelCfg {
        kind: TunnelKind::Local,
        local_host: "127.0.0.1".into(),
        local_port,
        remote_host: remote_host.into(),
        remote_port,
    }
}

pub fn remote_tunnel(local_port: u16, remote_port: u16) -> TunnelCfg {
    TunnelCfg {
        kind: TunnelKind::Remote,
        local_host: "127.0.0.1".into(),
        local_port,
        remote_host: "127.0.0.1".into(),
        remote_port,
    }
}

pub fn config_with(tunnels: Vec<(&str, TunnelCfg)>) -> Arc<StdRwLock<Config>> {
    let mut config = Config::default();
    for (name, cfg) in tunnels {
        config.tunnels.insert(name.to_string(), cfg);
    }
    Arc::new(StdRwLock::new(config))
}

pub fn add_group(config: &Arc<StdRwLock<Config>>, name: &str, tunnels: &[&str]) {
    config.write().unwrap().groups.insert(
        name.to_string(),
        GroupCfg {
            description: format!("{} group", name),
            tunnels: tunnels.iter().map(|s| s.to_string()).collect(),
        },
    );
}
