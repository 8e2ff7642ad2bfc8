//! Host and client in one process over the loopback platform
//!
//! Runs the whole lobby handshake without a relay server: the host creates a
//! lobby, the client joins it, and both tick until the client's spawn request
//! has reached the host.

use std::thread;
use std::time::{Duration, Instant};

use session_bridge::loopback::{LoopbackChannel, LoopbackDirectory, LoopbackNetwork};
use session_bridge::{BridgeConfig, HandshakePhase, PeerIdentity, SequencedEngine, SessionBridge};

use crate::metrics::NodeMetrics;

type LoopbackBridge = SessionBridge<LoopbackDirectory, LoopbackChannel, SequencedEngine>;

const HOST: PeerIdentity = PeerIdentity(1);
const CLIENT: PeerIdentity = PeerIdentity(2);

/// Upper bound on the whole demo
const DEMO_TIMEOUT: Duration = Duration::from_secs(5);

pub fn run(config: BridgeConfig, tick: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let network = LoopbackNetwork::new();
    let mut host = bridge(&network, HOST, config.clone());
    let mut client = bridge(&network, CLIENT, config);

    log::info!("Demo: host {} creating a lobby", HOST);
    host.create_session();

    let deadline = Instant::now() + DEMO_TIMEOUT;
    let mut joined = false;
    while client.phase() != HandshakePhase::Established || host.engine().spawned().len() < 2 {
        if Instant::now() > deadline {
            return Err(format!(
                "demo handshake did not complete (host {}, client {})",
                host.state(),
                client.state()
            )
            .into());
        }

        host.update();
        if let (false, Some(lobby)) = (joined, host.session()) {
            log::info!("Demo: client {} joining lobby {}", CLIENT, lobby);
            client.join_session(lobby);
            joined = true;
        }
        client.update();
        thread::sleep(tick);
    }

    for player in host.engine().spawned() {
        log::info!(
            "Demo: player entity {:?} owned by connection {}",
            player.entity,
            player.owner
        );
    }

    let metrics = NodeMetrics::new();
    metrics.observe(
        client.adapter_stats(),
        client.handshakes_completed(),
        client.spawn_drops(),
    );
    log::info!("Demo: client metrics\n{}", metrics.render());

    client.disconnect();
    host.update();
    host.disconnect();
    log::info!("Demo complete");
    Ok(())
}

fn bridge(network: &LoopbackNetwork, peer: PeerIdentity, config: BridgeConfig) -> LoopbackBridge {
    let (directory, channel) = network.endpoint(peer);
    SessionBridge::new(directory, channel, SequencedEngine::new(), config)
}
