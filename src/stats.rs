use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;

/// Snapshot of the aggregate connection counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Total number of accepted connections
    pub total_connections: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Bytes copied from local clients into channels
    pub bytes_sent: u64,
    /// Bytes copied from channels back to local clients
    pub bytes_received: u64,
    /// Unix timestamp when the tracker was created
    pub start_time: u64,
}

/// Aggregate statistics shared by the listener and every forwarding pair
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    start_time: u64,
    idle: Notify,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                total_connections: AtomicU64::new(0),
                active_connections: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                start_time: SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default(),
                idle: Notify::new(),
            }),
        }
    }

    /// Register a new connection; it counts as active until the guard is dropped
    pub fn connection_started(&self) -> ConnectionGuard {
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.active_connections.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            stats: self.clone(),
        }
    }

    fn connection_ended(&self) {
        if self.inner.active_connections.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        self.inner.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, bytes: u64) {
        self.inner.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.inner.active_connections.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            active_connections: self.inner.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            start_time: self.inner.start_time,
        }
    }

    /// Wait until no connection is active, or until `timeout` elapses.
    ///
    /// Returns `true` when drained.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.inner.idle.notified();
                if self.active_connections() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// Decrements the active connection count on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    stats: ConnectionStats,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connection_ended();
    }
}
