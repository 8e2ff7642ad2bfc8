//! Relay ↔ engine datagram pump
//!
//! Inbound: each tick, available relay datagrams are read and handed to the
//! engine connection registered for their sender. Datagrams from senders
//! with no registered connection are dropped.
//!
//! Outbound: frames the engine queued are sent to their peer over the relay.
//! A peer whose send fails is reported so its connection can be removed on
//! the next tick.

use crate::channel::PeerChannel;
use crate::error::BridgeError;
use crate::identity::PeerIdentity;
use crate::protocol::MAX_DATAGRAM_SIZE;
use crate::registry::ConnectionRegistry;
use crate::transport::ReliableTransport;

/// Running totals kept by the adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub datagrams_ingested: u64,
    pub datagrams_sent: u64,
    pub unknown_sender_drops: u64,
    pub transport_errors: u64,
}

/// Send every queued engine frame over the relay
///
/// Returns the number of frames sent and the peers whose send failed.
pub fn drain_outbound(
    channel: &mut dyn PeerChannel,
    engine: &mut dyn ReliableTransport,
) -> (usize, Vec<PeerIdentity>) {
    let mut sent = 0;
    let mut failed = Vec::new();

    while let Some((peer, frame)) = engine.poll_outbound() {
        if failed.contains(&peer) {
            continue;
        }
        match channel.send(peer, &frame) {
            Ok(()) => sent += 1,
            Err(e) => {
                log::warn!("Relay send to {} failed: {}", peer, e);
                failed.push(peer);
            }
        }
    }

    (sent, failed)
}

#[derive(Debug)]
pub struct TransportAdapter {
    buffer: Vec<u8>,
    max_per_tick: usize,
    failed: Vec<PeerIdentity>,
    stats: AdapterStats,
}

impl TransportAdapter {
    pub fn new(max_per_tick: usize) -> Self {
        Self {
            buffer: vec![0u8; MAX_DATAGRAM_SIZE],
            max_per_tick: max_per_tick.max(1),
            failed: Vec::new(),
            stats: AdapterStats::default(),
        }
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats
    }

    fn mark_failed(&mut self, peer: PeerIdentity) {
        self.stats.transport_errors += 1;
        if !self.failed.contains(&peer) {
            self.failed.push(peer);
        }
    }

    /// Ingest up to the per-tick limit of available datagrams
    ///
    /// A relay receive failure stops the pump and is returned to the caller.
    pub fn pump(
        &mut self,
        channel: &mut dyn PeerChannel,
        engine: &mut dyn ReliableTransport,
        registry: &ConnectionRegistry,
    ) -> Result<usize, BridgeError> {
        let mut ingested = 0;

        while ingested < self.max_per_tick {
            if channel.poll_available().is_none() {
                break;
            }
            let (len, sender) = match channel.receive(&mut self.buffer) {
                Ok(received) => received,
                Err(BridgeError::DatagramTooLarge { sender, size }) => {
                    ingested += 1;
                    self.stats.transport_errors += 1;
                    log::warn!("Dropped {}-byte datagram from {}: too large", size, sender);
                    continue;
                }
                Err(e) => {
                    self.stats.transport_errors += 1;
                    return Err(e);
                }
            };
            ingested += 1;

            let conn = match registry.lookup(sender) {
                Some(connection) => connection.conn,
                None => {
                    self.stats.unknown_sender_drops += 1;
                    log::debug!("Dropping {} bytes from unregistered sender {}", len, sender);
                    continue;
                }
            };

            log::trace!("Ingesting {} bytes from {} on {}", len, sender, conn);
            self.stats.datagrams_ingested += 1;
            match engine.ingest(conn, &self.buffer[..len]) {
                Ok(()) => {}
                Err(BridgeError::Decode(e)) => {
                    log::debug!("Dropping undecodable datagram from {}: {}", sender, e);
                }
                Err(e) => {
                    log::warn!("Ingest from {} failed: {}", sender, e);
                    self.mark_failed(sender);
                }
            }
        }

        Ok(ingested)
    }

    /// Send queued engine frames; failed peers are remembered
    pub fn flush_outbound(
        &mut self,
        channel: &mut dyn PeerChannel,
        engine: &mut dyn ReliableTransport,
    ) -> usize {
        let (sent, failed) = drain_outbound(channel, engine);
        self.stats.datagrams_sent += sent as u64;
        for peer in failed {
            self.mark_failed(peer);
        }
        sent
    }

    /// Peers whose traffic failed since the last call
    pub fn take_failed(&mut self) -> Vec<PeerIdentity> {
        std::mem::take(&mut self.failed)
    }
}
