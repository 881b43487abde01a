//! Network availability monitoring.
//!
//! The monitor polls a well-known DNS name every few seconds and reports
//! transitions between available and unavailable. It never initiates
//! reconnection itself; it only supplies edges and a wait primitive for
//! the daemon's reconnection tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{BoreError, Result};

const PROBE_INTERVAL: Duration = Duration::from_secs(5);
const PROBE_HOST: &str = "dns.google:443";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetStatus {
    Unknown,
    Available,
    Unavailable,
}

impl NetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetStatus::Unknown => "unknown",
            NetStatus::Available => "available",
            NetStatus::Unavailable => "unavailable",
        }
    }
}

type Probe = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;
type ChangeCallback = Arc<dyn Fn(NetStatus) + Send + Sync>;

pub struct NetworkMonitor {
    status: watch::Sender<NetStatus>,
    on_change: Mutex<Option<ChangeCallback>>,
    cancel: CancellationToken,
    probe: Probe,
}

impl NetworkMonitor {
    pub fn new() -> Arc<Self> {
        Self::with_probe(Arc::new(|| {
            Box::pin(async { tokio::net::lookup_host(PROBE_HOST).await.is_ok() })
        }))
    }

    /// Build a monitor with a custom probe. Tests drive transitions by
    /// flipping what the probe returns.
    pub fn with_probe(probe: Probe) -> Arc<Self> {
        let (status, _) = watch::channel(NetStatus::Unknown);
        Arc::new(Self {
            status,
            on_change: Mutex::new(None),
            cancel: CancellationToken::new(),
            probe,
        })
    }

    /// Start the polling task. Probes immediately, then on an interval.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor.probe_now().await;
            let mut ticker = tokio::time::interval(PROBE_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => return,
                    _ = ticker.tick() => monitor.probe_now().await,
                }
            }
        });
    }

    /// Run one probe and publish the result. The poll loop calls this on
    /// its interval; tests call it directly to drive transitions.
    pub async fn probe_now(&self) {
        let reachable = (self.probe)().await;
        let new_status = if reachable {
            NetStatus::Available
        } else {
            NetStatus::Unavailable
        };

        let changed = self.status.send_if_modified(|current| {
            if *current == new_status {
                false
            } else {
                *current = new_status;
                true
            }
        });

        if changed {
            debug!(status = new_status.as_str(), "network status changed");
            let callback = self.on_change.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(new_status);
            }
        }
    }

    pub fn status(&self) -> NetStatus {
        *self.status.borrow()
    }

    pub fn is_available(&self) -> bool {
        self.status() == NetStatus::Available
    }

    /// Register a transition callback. At most one subscriber; a new
    /// registration displaces the previous one.
    pub fn subscribe(&self, callback: impl Fn(NetStatus) + Send + Sync + 'static) {
        *self.on_change.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Block until the network is available or `cancel` fires. The watch
    /// receiver is subscribed before the availability check, so an edge
    /// landing between check and wait is never lost.
    pub async fn wait_for_available(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.status.subscribe();
        if *rx.borrow() == NetStatus::Available {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BoreError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(BoreError::Cancelled);
                    }
                    if *rx.borrow_and_update() == NetStatus::Available {
                        return Ok(());
                    }
                }
            }
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn flip_probe(flag: Arc<AtomicBool>) -> Probe {
        Arc::new(move || {
            let flag = Arc::clone(&flag);
            Box::pin(async move { flag.load(Ordering::SeqCst) })
        })
    }

    #[tokio::test]
    async fn reports_transitions_only() {
        let up = Arc::new(AtomicBool::new(true));
        let monitor = NetworkMonitor::with_probe(flip_probe(Arc::clone(&up)));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        monitor.subscribe(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        monitor.probe_now().await;
        monitor.probe_now().await;
        assert_eq!(monitor.status(), NetStatus::Available);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        up.store(false, Ordering::SeqCst);
        monitor.probe_now().await;
        assert_eq!(monitor.status(), NetStatus::Unavailable);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_available() {
        let up = Arc::new(AtomicBool::new(true));
        let monitor = NetworkMonitor::with_probe(flip_probe(up));
        monitor.probe_now().await;

        let cancel = CancellationToken::new();
        monitor.wait_for_available(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn waiter_wakes_on_edge() {
        let up = Arc::new(AtomicBool::new(false));
        let monitor = NetworkMonitor::with_probe(flip_probe(Arc::clone(&up)));
        monitor.probe_now().await;

        let cancel = CancellationToken::new();
        let waiter = {
            let monitor = Arc::clone(&monitor);
            let cancel = cancel.clone();
            tokio::spawn(async move { monitor.wait_for_available(&cancel).await })
        };

        up.store(true, Ordering::SeqCst);
        monitor.probe_now().await;

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake on the available edge")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn wait_honors_cancellation() {
        let up = Arc::new(AtomicBool::new(false));
        let monitor = NetworkMonitor::with_probe(flip_probe(up));
        monitor.probe_now().await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = monitor.wait_for_available(&cancel).await.unwrap_err();
        assert!(matches!(err, BoreError::Cancelled));
    }

    #[tokio::test]
    async fn resubscribing_displaces_prior_callback() {
        let up = Arc::new(AtomicBool::new(true));
        let monitor = NetworkMonitor::with_probe(flip_probe(up));

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        {
            let first = Arc::clone(&first);
            monitor.subscribe(move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let second = Arc::clone(&second);
            monitor.subscribe(move |_| {
                second.fetch_add(1, Ordering::SeqCst);
            });
        }

        monitor.probe_now().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
