//! Relay counters in Prometheus text exposition format.
//!
//! Atomic counters so the event loop can bump them without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    /// Peers bound to an address (gauge)
    pub registered_peers: AtomicU64,
    /// Open lobbies (gauge)
    pub open_lobbies: AtomicU64,
    /// Peer datagrams forwarded, including released held ones (counter)
    pub datagrams_relayed_total: AtomicU64,
    /// Payload bytes forwarded (counter)
    pub relay_bytes_total: AtomicU64,
    /// SessionRequest notifications sent (counter)
    pub session_requests_total: AtomicU64,
    /// SendFailed notifications sent (counter)
    pub send_failures_total: AtomicU64,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            registered_peers: AtomicU64::new(0),
            open_lobbies: AtomicU64::new(0),
            datagrams_relayed_total: AtomicU64::new(0),
            relay_bytes_total: AtomicU64::new(0),
            session_requests_total: AtomicU64::new(0),
            send_failures_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_relayed(&self, bytes: usize) {
        self.datagrams_relayed_total.fetch_add(1, Ordering::Relaxed);
        self.relay_bytes_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP relay_registered_peers Peers bound to an address\n\
             # TYPE relay_registered_peers gauge\n\
             relay_registered_peers {}\n\
             # HELP relay_open_lobbies Lobbies with at least one member\n\
             # TYPE relay_open_lobbies gauge\n\
             relay_open_lobbies {}\n\
             # HELP relay_datagrams_relayed_total Peer datagrams forwarded\n\
             # TYPE relay_datagrams_relayed_total counter\n\
             relay_datagrams_relayed_total {}\n\
             # HELP relay_bytes_total Peer payload bytes forwarded\n\
             # TYPE relay_bytes_total counter\n\
             relay_bytes_total {}\n\
             # HELP relay_session_requests_total Session requests raised\n\
             # TYPE relay_session_requests_total counter\n\
             relay_session_requests_total {}\n\
             # HELP relay_send_failures_total Datagrams that could not be delivered\n\
             # TYPE relay_send_failures_total counter\n\
             relay_send_failures_total {}\n\
             # HELP relay_uptime_seconds Server uptime in seconds\n\
             # TYPE relay_uptime_seconds gauge\n\
             relay_uptime_seconds {}\n",
            self.registered_peers.load(Ordering::Relaxed),
            self.open_lobbies.load(Ordering::Relaxed),
            self.datagrams_relayed_total.load(Ordering::Relaxed),
            self.relay_bytes_total.load(Ordering::Relaxed),
            self.session_requests_total.load(Ordering::Relaxed),
            self.send_failures_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
