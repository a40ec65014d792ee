//! Shutdown coordination
//!
//! Shutdown happens in two phases. The graceful token stops every listener
//! from accepting and asks keep-alive connections to close after their
//! current request. If connections are still open once the grace period
//! elapses, the force token cancels the remaining relays and connections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Counts live client connections
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    active: AtomicU64,
    idle: Notify,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; it stays counted until the guard drops.
    pub fn track(&self) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Resolve once no connection is tracked
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Gateway-wide shutdown signal
#[derive(Debug, Clone)]
pub struct Shutdown {
    graceful: CancellationToken,
    force: CancellationToken,
    grace: Duration,
    connections: ConnectionTracker,
}

impl Shutdown {
    pub fn new(grace: Duration) -> Self {
        Self {
            graceful: CancellationToken::new(),
            force: CancellationToken::new(),
            grace,
            connections: ConnectionTracker::new(),
        }
    }

    /// Fires when the gateway stops accepting
    pub fn token(&self) -> CancellationToken {
        self.graceful.clone()
    }

    /// Fires when the grace period is over
    pub fn force_token(&self) -> CancellationToken {
        self.force.clone()
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    pub fn is_shutting_down(&self) -> bool {
        self.graceful.is_cancelled()
    }

    /// Stop accepting, wait for in-flight connections up to the grace
    /// period, then force-close whatever is left.
    pub async fn drain(&self) {
        self.graceful.cancel();
        let active = self.connections.active_count();
        info!(active, grace = ?self.grace, "Draining connections");

        match tokio::time::timeout(self.grace, self.connections.wait_idle()).await {
            Ok(()) => info!("All connections drained"),
            Err(_) => warn!(
                remaining = self.connections.active_count(),
                "Grace period elapsed, closing remaining connections"
            ),
        }
        self.force.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counts() {
        let tracker = ConnectionTracker::new();
        let first = tracker.track();
        let second = tracker.track();
        assert_eq!(tracker.active_count(), 2);
        drop(first);
        drop(second);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_connections() {
        let shutdown = Shutdown::new(Duration::from_secs(5));
        let guard = shutdown.connections().track();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        shutdown.drain().await;
        release.await.unwrap();
        assert!(shutdown.is_shutting_down());
        assert_eq!(shutdown.connections().active_count(), 0);
        assert!(shutdown.force_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_drain_forces_after_grace() {
        let shutdown = Shutdown::new(Duration::from_millis(50));
        let _stuck = shutdown.connections().track();
        let force = shutdown.force_token();

        shutdown.drain().await;
        assert!(force.is_cancelled());
        assert_eq!(shutdown.connections().active_count(), 1);
    }
}
