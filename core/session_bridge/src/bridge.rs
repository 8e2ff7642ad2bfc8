//! Per-tick driver owning the platform, the engine and the handshake
//!
//! # Tick Order
//!
//! 1. Drain directory events and relay session requests into the event queue
//! 2. Apply queued events to the handshake state machine
//! 3. Engine housekeeping, then advance the current handshake sub-state
//! 4. Pump relay datagrams into the engine (only once P2P is established)
//! 5. Apply engine events, flush engine frames to the relay
//! 6. Remove connections whose relay traffic failed

use std::time::Instant;

use crate::adapter::{AdapterStats, TransportAdapter};
use crate::channel::PeerChannel;
use crate::config::BridgeConfig;
use crate::directory::SessionDirectory;
use crate::events::{EventQueue, PlatformEvent};
use crate::handshake::{
    HandshakePhase, HandshakeStateMachine, Platform, Role, SessionConnectionState,
};
use crate::identity::SessionId;
use crate::registry::ConnectionRegistry;
use crate::transport::ReliableTransport;

pub struct SessionBridge<D, C, T> {
    directory: D,
    channel: C,
    engine: T,
    events: EventQueue,
    handshake: HandshakeStateMachine,
    adapter: TransportAdapter,
}

impl<D, C, T> SessionBridge<D, C, T>
where
    D: SessionDirectory,
    C: PeerChannel,
    T: ReliableTransport,
{
    pub fn new(directory: D, channel: C, engine: T, config: BridgeConfig) -> Self {
        let adapter = TransportAdapter::new(config.max_datagrams_per_tick);
        Self {
            directory,
            channel,
            engine,
            events: EventQueue::new(),
            handshake: HandshakeStateMachine::new(config),
            adapter,
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub fn create_session(&mut self) {
        let mut platform = Platform {
            directory: &mut self.directory,
            channel: &mut self.channel,
            engine: &mut self.engine,
        };
        self.handshake.create_session(&mut platform, Instant::now());
    }

    pub fn join_session(&mut self, id: SessionId) {
        let mut platform = Platform {
            directory: &mut self.directory,
            channel: &mut self.channel,
            engine: &mut self.engine,
        };
        self.handshake.join_session(id, &mut platform, Instant::now());
    }

    pub fn cancel(&mut self) {
        let mut platform = Platform {
            directory: &mut self.directory,
            channel: &mut self.channel,
            engine: &mut self.engine,
        };
        self.handshake.cancel(&mut platform);
        self.events.clear();
    }

    pub fn disconnect(&mut self) {
        let mut platform = Platform {
            directory: &mut self.directory,
            channel: &mut self.channel,
            engine: &mut self.engine,
        };
        self.handshake.disconnect(&mut platform);
        self.events.clear();
    }

    /// Queue an event from outside the platform (invite UI, `+connect_lobby`)
    pub fn push_event(&mut self, event: PlatformEvent) {
        self.events.push(event);
    }

    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    /// Run one tick with an explicit clock
    pub fn update_at(&mut self, now: Instant) {
        while let Some(event) = self.directory.poll_event() {
            self.events.push(event.into());
        }
        while let Some(peer) = self.channel.poll_session_request() {
            self.events.push(PlatformEvent::PeerSessionRequested(peer));
        }

        {
            let mut platform = Platform {
                directory: &mut self.directory,
                channel: &mut self.channel,
                engine: &mut self.engine,
            };
            while let Some(event) = self.events.pop() {
                self.handshake.handle_event(event, &mut platform, now);
            }
            platform.engine.update();
            self.handshake.advance(&mut platform, now);
        }

        if !self.handshake.p2p_established() {
            return;
        }

        if let Err(e) = self
            .adapter
            .pump(&mut self.channel, &mut self.engine, self.handshake.registry())
        {
            log::warn!("Relay receive failed: {}", e);
        }

        {
            let mut platform = Platform {
                directory: &mut self.directory,
                channel: &mut self.channel,
                engine: &mut self.engine,
            };
            while let Some(event) = platform.engine.poll_event() {
                self.handshake.handle_transport_event(event, &mut platform);
            }
        }

        self.adapter.flush_outbound(&mut self.channel, &mut self.engine);

        let failed = self.adapter.take_failed();
        if !failed.is_empty() {
            let mut platform = Platform {
                directory: &mut self.directory,
                channel: &mut self.channel,
                engine: &mut self.engine,
            };
            self.handshake.remove_failed_peers(&failed, &mut platform);
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> SessionConnectionState {
        self.handshake.state()
    }

    pub fn phase(&self) -> HandshakePhase {
        self.handshake.phase()
    }

    pub fn role(&self) -> Option<Role> {
        self.handshake.role()
    }

    pub fn session(&self) -> Option<SessionId> {
        self.handshake.session()
    }

    pub fn join_friend_triggered(&self) -> bool {
        self.handshake.join_friend_triggered()
    }

    pub fn p2p_established(&self) -> bool {
        self.handshake.p2p_established()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.handshake.registry()
    }

    pub fn spawn_drops(&self) -> u64 {
        self.handshake.spawn_drops()
    }

    pub fn handshakes_completed(&self) -> u64 {
        self.handshake.handshakes_completed()
    }

    pub fn adapter_stats(&self) -> AdapterStats {
        self.adapter.stats()
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn engine(&self) -> &T {
        &self.engine
    }
}
