//! Lobby Node
//!
//! A peer process that:
//! - Registers with the relay server under a peer identity
//! - Hosts a lobby (`--create`) or joins one (`+connect_lobby <id>`)
//! - Drives the session bridge once per tick from a mio poll loop

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use session_bridge::protocol::DEFAULT_RELAY_PORT;
use session_bridge::{
    generate_peer_identity, parse_connect_lobby, BridgeConfig, PeerIdentity, PlatformEvent,
    SequencedEngine, SessionBridge, SessionConnectionState, SessionId,
};

mod demo;
mod metrics;
mod relay_link;

use metrics::NodeMetrics;
use relay_link::{LobbyDirectory, RelayChannel, RelayLink};

// ============================================================================
// Constants
// ============================================================================

/// mio token for the relay socket
const RELAY_TOKEN: Token = Token(0);

/// Default tick interval in milliseconds
const DEFAULT_TICK_MS: u64 = 16;

/// How often Hello is repeated until the relay answers
const HELLO_RETRY: Duration = Duration::from_secs(1);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();

    // --relay <addr:port>   Relay server address
    // --peer-id <u64>       Our identity (random if omitted)
    // --create              Host a new lobby
    // --config <path>       BridgeConfig JSON overrides
    // --tick-ms <ms>        Tick interval
    // --demo                Host and client in one process, no relay
    // +connect_lobby <id>   Join a lobby at startup

    let config = match parse_arg(&args, "--config") {
        Some(path) => BridgeConfig::from_json_file(&path)?,
        None => BridgeConfig::default(),
    };
    let tick = Duration::from_millis(match parse_arg(&args, "--tick-ms") {
        Some(ms) => ms.parse().map_err(|_| "Invalid --tick-ms")?,
        None => DEFAULT_TICK_MS,
    });

    if args.iter().any(|a| a == "--demo") {
        return demo::run(config, tick);
    }

    let relay_addr: SocketAddr = parse_arg(&args, "--relay")
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_RELAY_PORT))
        .parse()
        .map_err(|_| "Invalid relay address")?;
    let identity = match parse_arg(&args, "--peer-id") {
        Some(id) => PeerIdentity(id.parse().map_err(|_| "Invalid --peer-id")?),
        None => generate_peer_identity(),
    };
    let action = match (parse_connect_lobby(&args), args.iter().any(|a| a == "--create")) {
        (Some(lobby), _) => StartAction::Join(lobby),
        (None, true) => StartAction::Create,
        (None, false) => StartAction::Wait,
    };

    log::info!("Lobby node starting...");
    log::info!("  Relay:    {}", relay_addr);
    log::info!("  Identity: {}", identity);
    log::info!("  Tick:     {:?}", tick);
    log::info!("  Action:   {:?}", action);

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let mut node = Node::new(relay_addr, identity, config)?;
    node.run(action, tick, &shutdown)?;

    log::info!("Lobby node stopped\n{}", node.metrics.render());
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// What to do once the relay has registered us
#[derive(Debug, Clone, Copy)]
enum StartAction {
    Create,
    Join(SessionId),
    /// Idle until stopped
    Wait,
}

// ============================================================================
// Node Structure
// ============================================================================

struct Node {
    poll: Poll,
    link: RelayLink,
    bridge: SessionBridge<LobbyDirectory, RelayChannel, SequencedEngine>,
    metrics: NodeMetrics,
}

impl Node {
    fn new(
        relay: SocketAddr,
        identity: PeerIdentity,
        config: BridgeConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let poll = Poll::new()?;
        let bind_addr: SocketAddr = if relay.ip().is_loopback() {
            "127.0.0.1:0".parse()?
        } else {
            "0.0.0.0:0".parse()?
        };
        let mut socket = UdpSocket::bind(bind_addr)?;
        poll.registry()
            .register(&mut socket, RELAY_TOKEN, Interest::READABLE)?;
        log::info!("Bound {}", socket.local_addr()?);

        let link = RelayLink::new(socket, relay, identity);
        let (directory, channel) = link.endpoints();
        let bridge = SessionBridge::new(directory, channel, SequencedEngine::new(), config);

        Ok(Node {
            poll,
            link,
            bridge,
            metrics: NodeMetrics::new(),
        })
    }

    fn run(
        &mut self,
        action: StartAction,
        tick: Duration,
        shutdown: &AtomicBool,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(64);
        let mut pending_action = Some(action);
        let mut last_hello: Option<Instant> = None;
        let mut last_state = self.bridge.state();
        let mut next_tick = Instant::now();

        while !shutdown.load(Ordering::Relaxed) {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            // Drain on every wakeup; readiness is edge-triggered
            if let Err(e) = self.link.pump() {
                log::warn!("Relay receive failed: {}", e);
            }

            let now = Instant::now();
            if now < next_tick {
                continue;
            }
            next_tick = now + tick;

            if !self.link.is_registered() {
                if last_hello.map_or(true, |t| now.duration_since(t) >= HELLO_RETRY) {
                    if let Err(e) = self.link.hello() {
                        log::warn!("Hello failed: {}", e);
                    }
                    last_hello = Some(now);
                }
            } else if let Some(action) = pending_action.take() {
                self.start(action);
            }

            self.bridge.update_at(now);
            self.metrics.observe(
                self.bridge.adapter_stats(),
                self.bridge.handshakes_completed(),
                self.bridge.spawn_drops(),
            );

            let state = self.bridge.state();
            if state != last_state {
                self.report(state);
                last_state = state;
            }
        }

        log::info!("Shutdown requested");
        self.bridge.disconnect();
        Ok(())
    }

    fn start(&mut self, action: StartAction) {
        match action {
            StartAction::Create => self.bridge.create_session(),
            StartAction::Join(lobby) => self
                .bridge
                .push_event(PlatformEvent::InviteAccepted(lobby)),
            StartAction::Wait => log::info!("Registered; waiting for shutdown"),
        }
    }

    fn report(&self, state: SessionConnectionState) {
        match state {
            SessionConnectionState::Connected => log::info!(
                "Session {:?} as {:?} with {} connection(s)",
                self.bridge.session(),
                self.bridge.role(),
                self.bridge.registry().len()
            ),
            SessionConnectionState::Failed => {
                log::warn!("Session failed; restart the node to try again")
            }
            other => log::debug!("Session state {}", other),
        }
    }
}
