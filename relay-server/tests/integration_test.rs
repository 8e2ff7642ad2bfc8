//! Integration tests for the Relay Server
//!
//! Each test starts the real binary on its own port and talks to it over
//! plain UDP sockets.

use std::net::{SocketAddr, UdpSocket};
use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

use session_bridge::protocol::{RelayError, RelayMessage};
use session_bridge::{PeerIdentity, SessionId, Visibility};

/// Helper to spawn the relay server for tests
struct ServerProcess {
    child: Child,
    addr: SocketAddr,
}

impl ServerProcess {
    fn start(port: u16) -> Result<Self, Box<dyn std::error::Error>> {
        let child = Command::new(env!("CARGO_BIN_EXE_relay-server"))
            .arg(port.to_string())
            .env("RUST_LOG", "warn")
            .spawn()?;

        // Give server time to bind
        thread::sleep(Duration::from_millis(300));

        Ok(ServerProcess {
            child,
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        })
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct TestPeer {
    socket: UdpSocket,
    server: SocketAddr,
}

impl TestPeer {
    fn new(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        TestPeer { socket, server }
    }

    fn registered(server: SocketAddr, peer: PeerIdentity) -> Self {
        let p = Self::new(server);
        p.send(&RelayMessage::Hello { peer });
        assert_eq!(p.recv(), RelayMessage::Welcome { peer });
        p
    }

    fn send(&self, msg: &RelayMessage) {
        self.socket
            .send_to(&msg.encode().unwrap(), self.server)
            .unwrap();
    }

    fn recv(&self) -> RelayMessage {
        let mut buf = [0u8; 65535];
        let (len, _) = self.socket.recv_from(&mut buf).expect("no reply from relay");
        RelayMessage::decode(&buf[..len]).unwrap()
    }
}

macro_rules! start_or_skip {
    ($port:expr) => {
        match ServerProcess::start($port) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Skipping: could not start relay server: {}", e);
                return;
            }
        }
    };
}

#[test]
fn test_hello_welcome() {
    let server = start_or_skip!(27115);
    TestPeer::registered(server.addr, PeerIdentity(100));
}

#[test]
fn test_unregistered_sender_rejected() {
    let server = start_or_skip!(27116);
    let peer = TestPeer::new(server.addr);

    peer.send(&RelayMessage::JoinLobby { lobby: SessionId(1) });
    assert!(matches!(
        peer.recv(),
        RelayMessage::Error { code: RelayError::NotRegistered, .. }
    ));
}

#[test]
fn test_create_and_join_lobby() {
    let server = start_or_skip!(27117);
    let host = TestPeer::registered(server.addr, PeerIdentity(100));
    let client = TestPeer::registered(server.addr, PeerIdentity(200));

    host.send(&RelayMessage::CreateLobby {
        visibility: Visibility::Private,
        capacity: 4,
    });
    let lobby = match host.recv() {
        RelayMessage::LobbyEntered { lobby, owner, .. } => {
            assert_eq!(owner, PeerIdentity(100));
            lobby
        }
        other => panic!("Expected LobbyEntered, got {:?}", other),
    };

    client.send(&RelayMessage::JoinLobby { lobby });
    assert_eq!(
        client.recv(),
        RelayMessage::LobbyEntered {
            lobby,
            owner: PeerIdentity(100),
            members: vec![PeerIdentity(100), PeerIdentity(200)],
        }
    );
    assert!(matches!(host.recv(), RelayMessage::LobbyUpdated { .. }));
}

#[test]
fn test_join_missing_lobby() {
    let server = start_or_skip!(27118);
    let client = TestPeer::registered(server.addr, PeerIdentity(200));

    client.send(&RelayMessage::JoinLobby { lobby: SessionId(5) });
    assert_eq!(
        client.recv(),
        RelayMessage::LobbyEnterFailed {
            lobby: Some(SessionId(5)),
            code: RelayError::LobbyNotFound,
        }
    );
}

#[test]
fn test_held_datagram_released_on_accept() {
    let server = start_or_skip!(27119);
    let host = TestPeer::registered(server.addr, PeerIdentity(100));
    let client = TestPeer::registered(server.addr, PeerIdentity(200));

    client.send(&RelayMessage::Datagram {
        peer: PeerIdentity(100),
        payload: vec![],
    });
    assert_eq!(
        host.recv(),
        RelayMessage::SessionRequest { peer: PeerIdentity(200) }
    );

    host.send(&RelayMessage::AcceptSession { peer: PeerIdentity(200) });
    assert_eq!(
        host.recv(),
        RelayMessage::Datagram {
            peer: PeerIdentity(200),
            payload: vec![],
        }
    );

    host.send(&RelayMessage::Datagram {
        peer: PeerIdentity(200),
        payload: vec![7],
    });
    assert_eq!(
        client.recv(),
        RelayMessage::Datagram {
            peer: PeerIdentity(100),
            payload: vec![7],
        }
    );
}
