//! Host/client handshake scenarios over the loopback platform
//!
//! Lobby members are peers 100 (owner) and 200; 999 is never a member.
//! Peer 300 is only ever a bystander or a second host.

use std::time::{Duration, Instant};

use session_bridge::codec::encode_message;
use session_bridge::engine::EngineFrame;
use session_bridge::loopback::{LoopbackChannel, LoopbackDirectory, LoopbackNetwork};
use session_bridge::{
    parse_connect_lobby, BridgeConfig, HandshakePhase, PeerChannel, PeerIdentity, PlatformEvent,
    Role, SequencedEngine, SessionBridge, SessionConnectionState, SessionId,
};

const HOST: PeerIdentity = PeerIdentity(100);
const CLIENT: PeerIdentity = PeerIdentity(200);
const STRANGER: PeerIdentity = PeerIdentity(999);

type Bridge = SessionBridge<LoopbackDirectory, LoopbackChannel, SequencedEngine>;

fn bridge(network: &LoopbackNetwork, peer: PeerIdentity) -> Bridge {
    bridge_with(network, peer, BridgeConfig::default())
}

fn bridge_with(network: &LoopbackNetwork, peer: PeerIdentity, config: BridgeConfig) -> Bridge {
    let (directory, channel) = network.endpoint(peer);
    SessionBridge::new(directory, channel, SequencedEngine::new(), config)
}

/// Host that owns a lobby and is accepting members
fn hosting(network: &LoopbackNetwork) -> (Bridge, SessionId) {
    let mut host = bridge(network, HOST);
    host.create_session();
    host.update();
    let lobby = host.session().expect("host should be in a lobby");
    (host, lobby)
}

fn run(nodes: &mut [&mut Bridge], ticks: usize) {
    for _ in 0..ticks {
        for node in nodes.iter_mut() {
            node.update();
        }
    }
}

fn connected_pair(network: &LoopbackNetwork) -> (Bridge, Bridge) {
    let (mut host, lobby) = hosting(network);
    let mut client = bridge(network, CLIENT);
    client.join_session(lobby);
    run(&mut [&mut client, &mut host], 8);
    (host, client)
}

#[test]
fn test_host_scenario() {
    let network = LoopbackNetwork::new();
    let (host, lobby) = hosting(&network);

    assert_eq!(host.state(), SessionConnectionState::Connected);
    assert_eq!(host.role(), Some(Role::Host));
    assert_eq!(host.registry().len(), 1);
    assert!(!host.registry().lookup(HOST).unwrap().is_remote());
    assert_eq!(network.lobby_members(lobby), vec![HOST]);
}

#[test]
fn test_full_handshake_round_trip() {
    let network = LoopbackNetwork::new();
    let (host, client) = connected_pair(&network);

    // Host: {100: local, 200: remote}
    assert!(host.p2p_established());
    assert_eq!(host.registry().len(), 2);
    assert!(host.registry().lookup(CLIENT).unwrap().is_remote());

    // Client: {100: remote}
    assert_eq!(client.state(), SessionConnectionState::Connected);
    assert_eq!(client.role(), Some(Role::Client));
    assert!(client.p2p_established());
    assert_eq!(client.registry().len(), 1);
    assert!(client.registry().lookup(HOST).unwrap().is_remote());
    assert_eq!(client.phase(), HandshakePhase::Established);

    // Host spawned its own player plus the client's
    let client_conn = host.registry().lookup(CLIENT).unwrap().conn;
    let spawned = host.engine().spawned();
    assert_eq!(spawned.len(), 2);
    assert_eq!(spawned[1].owner, client_conn);
    assert_eq!(host.spawn_drops(), 0);
}

#[test]
fn test_exactly_one_host_per_lobby() {
    let network = LoopbackNetwork::new();
    let (host, client) = connected_pair(&network);

    let hosts = [host.role(), client.role()]
        .iter()
        .filter(|r| **r == Some(Role::Host))
        .count();
    assert_eq!(hosts, 1);
}

#[test]
fn test_connect_handler_fires_once() {
    let network = LoopbackNetwork::new();
    let (mut host, mut client) = connected_pair(&network);
    assert_eq!(client.handshakes_completed(), 1);

    run(&mut [&mut client, &mut host], 8);
    assert_eq!(client.handshakes_completed(), 1);
    assert_eq!(host.engine().spawned().len(), 2);
}

#[test]
fn test_non_member_request_ignored() {
    let network = LoopbackNetwork::new();
    let (mut host, _) = hosting(&network);
    let (_, mut stranger) = network.endpoint(STRANGER);

    stranger.send(HOST, &[]).unwrap();
    run(&mut [&mut host], 3);

    assert_eq!(host.registry().len(), 1);
    assert!(!host.p2p_established());
    assert!(!stranger.session_state(HOST).is_established());
    assert_eq!(stranger.poll_available(), None);
}

#[test]
fn test_disconnect_twice() {
    let network = LoopbackNetwork::new();
    let (_host, mut client) = connected_pair(&network);

    for _ in 0..2 {
        client.disconnect();
        assert_eq!(client.state(), SessionConnectionState::Disconnected);
        assert!(client.registry().is_empty());
        assert!(!client.p2p_established());
        assert!(client.session().is_none());
    }
}

#[test]
fn test_client_disconnect_releases_host_entry() {
    let network = LoopbackNetwork::new();
    let (mut host, mut client) = connected_pair(&network);
    let lobby = host.session().unwrap();

    client.disconnect();
    run(&mut [&mut host], 2);

    assert_eq!(host.registry().len(), 1);
    assert!(host.registry().lookup(CLIENT).is_none());
    assert_eq!(network.lobby_members(lobby), vec![HOST]);
}

#[test]
fn test_host_disconnect_ends_client_session() {
    let network = LoopbackNetwork::new();
    let (mut host, mut client) = connected_pair(&network);

    host.disconnect();
    run(&mut [&mut client], 2);

    assert_eq!(client.state(), SessionConnectionState::Disconnected);
    assert!(client.registry().is_empty());
}

#[test]
fn test_platform_unavailable() {
    let network = LoopbackNetwork::new();
    network.set_online(false);
    let mut node = bridge(&network, HOST);

    node.create_session();
    node.update();
    assert_eq!(node.state(), SessionConnectionState::Failed);

    node.join_session(SessionId(1));
    node.update();
    assert_eq!(node.state(), SessionConnectionState::Failed);
    assert!(node.role().is_none());
}

#[test]
fn test_unanswered_probe_times_out() {
    let network = LoopbackNetwork::new();
    let (_host, lobby) = hosting(&network);
    let mut client = bridge(&network, CLIENT);

    client.join_session(lobby);
    client.update();
    client.update();
    assert!(matches!(client.phase(), HandshakePhase::AwaitingFirstDatagram { .. }));
    assert_eq!(client.state(), SessionConnectionState::Connected);

    // Host never ticks, so the probe is never answered
    client.update_at(Instant::now() + Duration::from_secs(60));
    assert_eq!(client.state(), SessionConnectionState::Failed);
    assert!(client.registry().is_empty());
}

#[test]
fn test_configured_timeout_applies() {
    let network = LoopbackNetwork::new();
    let (_host, lobby) = hosting(&network);
    let config = BridgeConfig::from_json(r#"{"handshake_timeout_ms": 50}"#).unwrap();
    let mut client = bridge_with(&network, CLIENT, config);

    client.join_session(lobby);
    let start = Instant::now();
    client.update_at(start);
    client.update_at(start + Duration::from_millis(10));
    assert_eq!(client.state(), SessionConnectionState::Connected);

    client.update_at(start + Duration::from_millis(100));
    assert_eq!(client.state(), SessionConnectionState::Failed);
}

#[test]
fn test_invite_while_connected_switches_lobby() {
    let network = LoopbackNetwork::new();
    let (mut host, mut client) = connected_pair(&network);
    let first = host.session().unwrap();

    let mut other_host = bridge(&network, PeerIdentity(300));
    other_host.create_session();
    other_host.update();
    let second = other_host.session().unwrap();

    network.deliver_invite(CLIENT, second);
    run(&mut [&mut client, &mut other_host, &mut host], 8);

    assert_eq!(client.session(), Some(second));
    assert_eq!(client.role(), Some(Role::Client));
    assert_eq!(client.phase(), HandshakePhase::Established);
    assert!(client.registry().lookup(PeerIdentity(300)).is_some());
    assert_eq!(network.lobby_members(first), vec![HOST]);
    assert_eq!(host.registry().len(), 1);
}

#[test]
fn test_connect_lobby_argument_joins() {
    let network = LoopbackNetwork::new();
    let (mut host, lobby) = hosting(&network);
    let args: Vec<String> = vec![
        "lobby-node".to_string(),
        "+connect_lobby".to_string(),
        lobby.to_string(),
    ];

    let mut client = bridge(&network, CLIENT);
    let target = parse_connect_lobby(&args).expect("lobby id should parse");
    client.push_event(PlatformEvent::InviteAccepted(target));
    run(&mut [&mut client, &mut host], 8);

    assert_eq!(client.session(), Some(lobby));
    assert!(client.p2p_established());
    assert!(!client.join_friend_triggered());
}

#[test]
fn test_cancel_before_connected() {
    let network = LoopbackNetwork::new();
    let (_host, lobby) = hosting(&network);
    let mut client = bridge(&network, CLIENT);

    client.join_session(lobby);
    client.cancel();
    client.update();

    assert_eq!(client.state(), SessionConnectionState::Cancelled);
    assert_eq!(network.lobby_members(lobby), vec![HOST]);
}

#[test]
fn test_host_drops_peer_after_failed_send() {
    let network = LoopbackNetwork::new();
    let (mut host, _client) = connected_pair(&network);
    let stats_before = host.adapter_stats();

    // A repeated connect request makes the host answer a peer that has left
    let (_, mut client_channel) = network.endpoint(CLIENT);
    let request = encode_message(&EngineFrame::ConnectRequest).unwrap();
    client_channel.send(HOST, &request).unwrap();
    network.remove_endpoint(CLIENT);
    run(&mut [&mut host], 1);

    assert!(host.registry().lookup(CLIENT).is_none());
    assert_eq!(host.registry().len(), 1);
    assert_eq!(host.engine().connection_count(), 1);
    assert_eq!(host.adapter_stats().transport_errors, stats_before.transport_errors + 1);
    assert!(!host.channel().session_state(CLIENT).is_established());
    assert_eq!(host.state(), SessionConnectionState::Connected);
}

#[test]
fn test_client_fails_after_bad_frame_from_host() {
    let network = LoopbackNetwork::new();
    let (_host, mut client) = connected_pair(&network);

    let (_, mut host_channel) = network.endpoint(HOST);
    let frame = EngineFrame::Message {
        channel: 9,
        sequence: 100,
        msg_type: 7,
        payload: Vec::new(),
    };
    host_channel.send(CLIENT, &encode_message(&frame).unwrap()).unwrap();
    run(&mut [&mut client], 1);

    assert_eq!(client.state(), SessionConnectionState::Failed);
    assert!(client.registry().is_empty());
    assert!(!client.p2p_established());
}

#[test]
fn test_bystander_datagram_ignored_while_awaiting_host() {
    let network = LoopbackNetwork::new();
    let (mut host, lobby) = hosting(&network);
    let mut client = bridge(&network, CLIENT);

    client.join_session(lobby);
    client.update();
    client.update();
    assert!(matches!(client.phase(), HandshakePhase::AwaitingFirstDatagram { .. }));

    let bystander = PeerIdentity(300);
    let (_, mut client_channel) = network.endpoint(CLIENT);
    client_channel.accept_session(bystander);
    let (_, mut bystander_channel) = network.endpoint(bystander);
    bystander_channel.send(CLIENT, b"not the host").unwrap();

    client.update();
    assert!(matches!(client.phase(), HandshakePhase::AwaitingFirstDatagram { .. }));
    assert!(!client.p2p_established());
    assert!(client.registry().is_empty());

    run(&mut [&mut host, &mut client], 8);
    assert_eq!(client.phase(), HandshakePhase::Established);
    assert!(client.p2p_established());
    assert!(client.registry().lookup(bystander).is_none());
}

#[test]
fn test_engine_refusal_closes_relay_session() {
    let network = LoopbackNetwork::new();
    let config = BridgeConfig::from_json(
        r#"{"topology": {"channels": ["ReliableSequenced"], "max_connections": 1}}"#,
    )
    .unwrap();
    let mut host = bridge_with(&network, HOST, config);
    host.create_session();
    host.update();
    let lobby = host.session().expect("host should be in a lobby");

    let mut client = bridge(&network, CLIENT);
    client.join_session(lobby);
    run(&mut [&mut client, &mut host], 4);

    assert!(host.registry().lookup(CLIENT).is_none());
    assert_eq!(host.registry().len(), 1);
    assert!(!host.p2p_established());
    assert!(!host.channel().session_state(CLIENT).is_established());
}
