//! Node counters in Prometheus text exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use session_bridge::AdapterStats;

pub struct NodeMetrics {
    pub datagrams_ingested: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub handshakes_completed: AtomicU64,
    /// Spawn requests that named an unknown peer or failed to decode
    pub spawn_drops: AtomicU64,
    pub transport_errors: AtomicU64,
    pub start_time: Instant,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            datagrams_ingested: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            handshakes_completed: AtomicU64::new(0),
            spawn_drops: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Copy the bridge's running totals
    pub fn observe(&self, stats: AdapterStats, handshakes_completed: u64, spawn_drops: u64) {
        self.datagrams_ingested
            .store(stats.datagrams_ingested, Ordering::Relaxed);
        self.datagrams_sent
            .store(stats.datagrams_sent, Ordering::Relaxed);
        self.transport_errors
            .store(stats.transport_errors, Ordering::Relaxed);
        self.handshakes_completed
            .store(handshakes_completed, Ordering::Relaxed);
        self.spawn_drops.store(spawn_drops, Ordering::Relaxed);
    }

    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP node_datagrams_ingested_total Relay datagrams handed to the engine\n\
             # TYPE node_datagrams_ingested_total counter\n\
             node_datagrams_ingested_total {}\n\
             # HELP node_datagrams_sent_total Engine frames sent through the relay\n\
             # TYPE node_datagrams_sent_total counter\n\
             node_datagrams_sent_total {}\n\
             # HELP node_handshakes_completed_total Client handshakes that reached the engine\n\
             # TYPE node_handshakes_completed_total counter\n\
             node_handshakes_completed_total {}\n\
             # HELP node_spawn_drops_total Spawn requests dropped\n\
             # TYPE node_spawn_drops_total counter\n\
             node_spawn_drops_total {}\n\
             # HELP node_transport_errors_total Relay send or ingest failures\n\
             # TYPE node_transport_errors_total counter\n\
             node_transport_errors_total {}\n\
             # HELP node_uptime_seconds Node uptime in seconds\n\
             # TYPE node_uptime_seconds gauge\n\
             node_uptime_seconds {}\n",
            self.datagrams_ingested.load(Ordering::Relaxed),
            self.datagrams_sent.load(Ordering::Relaxed),
            self.handshakes_completed.load(Ordering::Relaxed),
            self.spawn_drops.load(Ordering::Relaxed),
            self.transport_errors.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
