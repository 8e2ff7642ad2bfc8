//! Relay Server
//!
//! A UDP server that:
//! - Binds peer identities to addresses (Hello)
//! - Hosts lobbies with an owner and bounded membership
//! - Relays peer datagrams, holding them until the receiver accepts the sender

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use session_bridge::protocol::{RelayError, RelayMessage, DEFAULT_RELAY_PORT, MAX_DATAGRAM_SIZE};

mod client;
mod metrics;
mod registry;
mod relay;
mod signaling;

use relay::{Outbox, Relay};

// ============================================================================
// Constants
// ============================================================================

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

/// Upper bound on one poll; request expiry runs at least this often
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // relay-server [port] [--request-timeout-ms <ms>]
    let args: Vec<String> = std::env::args().collect();
    let port = args
        .get(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_RELAY_PORT);
    let request_timeout = match parse_arg(&args, "--request-timeout-ms") {
        Some(ms) => Duration::from_millis(ms.parse().map_err(|_| "Invalid --request-timeout-ms")?),
        None => signaling::DEFAULT_REQUEST_TIMEOUT,
    };

    log::info!("Relay server starting...");
    log::info!("  Port:            {}", port);
    log::info!("  Request timeout: {:?}", request_timeout);

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let mut server = Server::new(port, request_timeout)?;
    server.run(&shutdown)?;

    log::info!("Relay server stopped\n{}", server.relay.metrics().render());
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Server Structure
// ============================================================================

struct Server {
    poll: Poll,
    socket: UdpSocket,
    relay: Relay,
    recv_buf: Vec<u8>,
}

impl Server {
    fn new(port: u16, request_timeout: Duration) -> Result<Self, Box<dyn std::error::Error>> {
        let poll = Poll::new()?;
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let mut socket = UdpSocket::bind(addr)?;

        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        log::info!("Server listening on {}", addr);

        Ok(Server {
            poll,
            socket,
            relay: Relay::new(request_timeout),
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    fn run(&mut self, shutdown: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(1024);

        while !shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.process_socket()?;
                }
            }

            let expired = self.relay.expire(Instant::now());
            self.send_all(expired);
        }

        log::info!("Shutdown requested");
        Ok(())
    }

    fn process_socket(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };

            let out = match RelayMessage::decode(&self.recv_buf[..len]) {
                Ok(msg) => {
                    log::trace!("Received {:?} from {}", msg, from);
                    self.relay.handle(from, msg, Instant::now())
                }
                Err(e) => {
                    log::debug!("Undecodable datagram ({} bytes) from {}: {}", len, from, e);
                    vec![(
                        from,
                        RelayMessage::error(RelayError::InvalidMessage, e.to_string()),
                    )]
                }
            };
            self.send_all(out);
        }

        Ok(())
    }

    fn send_all(&self, out: Outbox) {
        for (to, msg) in out {
            let bytes = match msg.encode() {
                Ok(b) => b,
                Err(e) => {
                    log::error!("Failed to encode {:?}: {}", msg, e);
                    continue;
                }
            };
            if let Err(e) = self.socket.send_to(&bytes, to) {
                log::debug!("Send to {} failed: {}", to, e);
            }
        }
    }
}
