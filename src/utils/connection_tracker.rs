//! In-flight request tracking & graceful draining.
//!
//! Each request registers a lightweight record keyed by an id. During
//! shutdown the tracker waits for in-flight requests to finish, bounded by
//! the drain timeout.
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use scc::HashMap;
use tokio::time::sleep;

/// Unique identifier for a tracked connection.
pub type ConnectionId = u64;

/// Information about an active connection.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub established_at: Instant,
    pub active_requests: AtomicU64,
}

impl ConnectionInfo {
    fn new(id: ConnectionId, remote_addr: SocketAddr) -> Self {
        Self {
            id,
            remote_addr,
            established_at: Instant::now(),
            active_requests: AtomicU64::new(0),
        }
    }

    pub fn increment_requests(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_requests(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_request_count(&self) -> u64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }
}

/// Tracks active requests and provides the drain-wait primitive.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    connections: Arc<HashMap<ConnectionId, Arc<ConnectionInfo>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(HashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new connection and return an Arc to its info record.
    pub fn register(&self, remote_addr: SocketAddr) -> Arc<ConnectionInfo> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(ConnectionInfo::new(id, remote_addr));
        let _ = self.connections.insert_sync(id, info.clone());
        info
    }

    /// Remove a connection by id.
    pub fn unregister(&self, connection_id: ConnectionId) {
        let _ = self.connections.remove_sync(&connection_id);
    }

    /// Current number of registered connections.
    pub fn active_connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sum of active requests across all connections.
    pub fn total_active_requests(&self) -> u64 {
        let mut total = 0;
        self.connections.retain_sync(|_, info| {
            total += info.active_request_count();
            true
        });
        total
    }

    /// Whether any connection currently has >0 active requests.
    pub fn has_active_requests(&self) -> bool {
        let mut has_active = false;
        self.connections.retain_sync(|_, info| {
            if info.active_request_count() > 0 {
                has_active = true;
            }
            true
        });
        has_active
    }

    /// Wait until all requests are done or the timeout elapses. Returns
    /// whether the drain completed.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut check_interval = Duration::from_millis(50);

        while start.elapsed() < timeout {
            if !self.has_active_requests() {
                tracing::info!("all in-flight requests drained");
                return true;
            }
            tracing::debug!(
                remaining = self.total_active_requests(),
                elapsed = ?start.elapsed(),
                "waiting for in-flight requests"
            );
            sleep(check_interval).await;
            check_interval = std::cmp::min(check_interval * 2, Duration::from_secs(1));
        }

        tracing::warn!(
            remaining = self.total_active_requests(),
            "drain timeout exceeded"
        );
        false
    }
}
