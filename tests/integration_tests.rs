//! Integration tests for the position-sync server
//!
//! These tests run a real server on an ephemeral loopback port and talk to
//! it over TCP with the shared codec.

use futures_util::{SinkExt, StreamExt};
use overworld_server::{BroadcastPolicy, ControlHandle, Server, ServerConfig};
use overworld_shared::{
    ClientMessage, ConnectionId, ControlReply, ControlRequest, MessageCodec, PlayerEntry,
    PlayerState, Position, ServerMessage, TileMap,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_test::assert_ok;
use tokio_util::codec::{Framed, FramedWrite};

const WAIT: Duration = Duration::from_secs(5);

type Players = BTreeMap<ConnectionId, PlayerState>;

struct TestServer {
    addr: SocketAddr,
    admin_addr: Option<SocketAddr>,
    control: ControlHandle,
    task: JoinHandle<Result<(), overworld_server::ServerError>>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Self {
        let server = Server::bind(ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..config
        })
        .await
        .expect("bind test server");
        let addr = server.local_addr().unwrap();
        let admin_addr = server.admin_addr();
        let control = server.control();
        let task = tokio::spawn(server.run());
        TestServer {
            addr,
            admin_addr,
            control,
            task,
        }
    }

    async fn stop(self) {
        self.control.shutdown();
        let result = timeout(WAIT, self.task)
            .await
            .expect("server did not stop in time")
            .expect("server task panicked");
        assert_ok!(result);
    }

    /// Polls until the registry satisfies `pred`.
    async fn wait_for_players(&self, pred: impl Fn(&[PlayerEntry]) -> bool) {
        self.wait_for_players_within(WAIT, pred).await
    }

    async fn wait_for_players_within(
        &self,
        limit: Duration,
        pred: impl Fn(&[PlayerEntry]) -> bool,
    ) {
        let deadline = Instant::now() + limit;
        loop {
            let players = self.control.list_players().await;
            if pred(&players) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "registry never reached expected state: {:?}",
                players
            );
            sleep(Duration::from_millis(10)).await;
        }
    }
}

struct TestClient {
    id: ConnectionId,
    world: TileMap,
    frames: Framed<TcpStream, MessageCodec<ServerMessage, ClientMessage>>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let mut frames = Framed::new(stream, MessageCodec::new());
        match recv(&mut frames).await {
            Some(ServerMessage::Welcome { id, world }) => TestClient { id, world, frames },
            other => panic!("expected welcome, got {:?}", other),
        }
    }

    async fn send(&mut self, message: ClientMessage) {
        self.frames.send(message).await.expect("send");
    }

    async fn move_to(&mut self, x: i32, y: i32) {
        self.send(ClientMessage::update(x, y)).await;
    }

    async fn recv(&mut self) -> Option<ServerMessage> {
        recv(&mut self.frames).await
    }

    /// Reads until a snapshot satisfying `pred` arrives.
    async fn snapshot_where(&mut self, pred: impl Fn(&Players) -> bool) -> Players {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = timeout(remaining, self.frames.next())
                .await
                .expect("timed out waiting for snapshot")
                .expect("connection closed while waiting for snapshot")
                .expect("decode error");
            if let ServerMessage::Snapshot { players } = message {
                if pred(&players) {
                    return players;
                }
            }
        }
    }

    /// Reads until the server closes the connection.
    async fn expect_closed(&mut self) {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.frames.next()).await {
                Err(_) => panic!("connection was not closed"),
                Ok(None) | Ok(Some(Err(_))) => return,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}

async fn recv(
    frames: &mut Framed<TcpStream, MessageCodec<ServerMessage, ClientMessage>>,
) -> Option<ServerMessage> {
    timeout(WAIT, frames.next())
        .await
        .expect("timed out waiting for message")
        .map(|r| r.expect("decode error"))
}

fn at(x: i32, y: i32) -> Position {
    Position { x, y }
}

/// SESSION LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    /// Welcome carries the server-side id and the current map
    #[tokio::test]
    async fn welcome_identifies_client() {
        let server = TestServer::start(ServerConfig::default()).await;
        let client = TestClient::connect(server.addr).await;

        assert_eq!(client.id.addr(), client.frames.get_ref().local_addr().unwrap());
        assert_eq!(client.world, TileMap::default());
        server
            .wait_for_players(|p| p.len() == 1 && p[0].state == PlayerState::default())
            .await;

        server.stop().await;
    }

    /// Joining while others are busy moving still gets welcome before any snapshot
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn welcome_precedes_snapshots_under_load() {
        let server = TestServer::start(ServerConfig {
            outbound_queue: 16_384,
            ..ServerConfig::default()
        })
        .await;

        let mover = TestClient::connect(server.addr).await;
        let (mut sink, mut stream) = mover.frames.split();
        let moving = tokio::spawn(async move {
            let mut step = 0;
            while sink.send(ClientMessage::update(step % 10, 0)).await.is_ok() {
                step += 1;
                tokio::task::yield_now().await;
            }
        });
        let draining = tokio::spawn(async move { while let Some(Ok(_)) = stream.next().await {} });

        let mut out_of_order = 0;
        for _ in 0..50 {
            let stream = TcpStream::connect(server.addr).await.unwrap();
            let mut frames: Framed<_, MessageCodec<ServerMessage, ClientMessage>> =
                Framed::new(stream, MessageCodec::new());
            match recv(&mut frames).await {
                Some(ServerMessage::Welcome { .. }) => {}
                other => {
                    eprintln!("first frame was {:?}", other);
                    out_of_order += 1;
                }
            }
        }
        assert_eq!(out_of_order, 0);

        server.stop().await;
        moving.abort();
        draining.abort();
    }

    /// A and B connect; A's update reaches B; B vanishes abruptly; A stops seeing B
    #[tokio::test]
    async fn two_clients_update_and_abrupt_disconnect() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut a = TestClient::connect(server.addr).await;
        let mut b = TestClient::connect(server.addr).await;
        let (a_id, b_id) = (a.id, b.id);

        a.move_to(1, 1).await;
        let seen_by_b = b
            .snapshot_where(|p| p.contains_key(&a_id) && p.contains_key(&b_id))
            .await;
        assert_eq!(seen_by_b[&a_id].position(), at(1, 1));

        a.move_to(5, 7).await;
        let seen_by_b = b
            .snapshot_where(|p| p.get(&a_id).map(|s| s.position()) == Some(at(5, 7)))
            .await;
        assert_eq!(seen_by_b.len(), 2);

        // Drop B's socket without a leave message.
        drop(b);
        let seen_by_a = a.snapshot_where(|p| !p.contains_key(&b_id)).await;
        assert!(seen_by_a.contains_key(&a_id));
        server.wait_for_players(|p| p.len() == 1).await;

        server.stop().await;
    }

    /// Names ride along with updates and show up in everyone's snapshot
    #[tokio::test]
    async fn names_are_broadcast() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut a = TestClient::connect(server.addr).await;
        let mut b = TestClient::connect(server.addr).await;
        let a_id = a.id;

        a.send(ClientMessage::Update {
            position: at(2, 3),
            name: Some("Misty".to_string()),
        })
        .await;

        let players = b
            .snapshot_where(|p| p.get(&a_id).and_then(|s| s.name.clone()).is_some())
            .await;
        assert_eq!(players[&a_id].name.as_deref(), Some("Misty"));

        server.stop().await;
    }

    /// A graceful leave removes the session just like a dropped socket
    #[tokio::test]
    async fn leave_message_closes_session() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut a = TestClient::connect(server.addr).await;
        let mut b = TestClient::connect(server.addr).await;
        let b_id = b.id;

        b.send(ClientMessage::Leave).await;
        b.expect_closed().await;
        a.snapshot_where(|p| !p.contains_key(&b_id)).await;
        server.wait_for_players(|p| p.len() == 1).await;

        server.stop().await;
    }

    /// The tile map is relayed on request
    #[tokio::test]
    async fn world_on_request() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut a = TestClient::connect(server.addr).await;

        a.send(ClientMessage::RequestWorld).await;
        loop {
            match a.recv().await {
                Some(ServerMessage::World { grid }) => {
                    assert_eq!(grid, TileMap::default());
                    break;
                }
                Some(_) => continue,
                None => panic!("connection closed"),
            }
        }

        server.stop().await;
    }

    /// Connections beyond capacity are turned away without disturbing others
    #[tokio::test]
    async fn capacity_limit() {
        let server = TestServer::start(ServerConfig {
            max_sessions: 1,
            ..ServerConfig::default()
        })
        .await;
        let mut a = TestClient::connect(server.addr).await;

        let stream = TcpStream::connect(server.addr).await.unwrap();
        let mut rejected: Framed<_, MessageCodec<ServerMessage, ClientMessage>> =
            Framed::new(stream, MessageCodec::new());
        let next = timeout(WAIT, rejected.next()).await.expect("rejected client hung");
        assert!(matches!(next, None | Some(Err(_))));

        a.move_to(4, 4).await;
        a.snapshot_where(|p| p.len() == 1).await;

        server.stop().await;
    }

    /// Silent clients are dropped after the idle timeout
    #[tokio::test]
    async fn idle_clients_time_out() {
        let server = TestServer::start(ServerConfig {
            idle_timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        })
        .await;
        let mut a = TestClient::connect(server.addr).await;

        a.expect_closed().await;
        server.wait_for_players(|p| p.is_empty()).await;

        server.stop().await;
    }
}

/// BROADCAST POLICY TESTS
mod policy_tests {
    use super::*;

    /// Under the default policy the sender sees its own update echoed back
    #[tokio::test]
    async fn originator_receives_own_update() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut a = TestClient::connect(server.addr).await;
        let a_id = a.id;

        a.move_to(9, 9).await;
        let players = a
            .snapshot_where(|p| p.get(&a_id).map(|s| s.position()) == Some(at(9, 9)))
            .await;
        assert_eq!(players.len(), 1);

        server.stop().await;
    }

    /// With exclusion the sender gets nothing for its own update, others do
    #[tokio::test]
    async fn originator_excluded_when_configured() {
        let server = TestServer::start(ServerConfig {
            broadcast_policy: BroadcastPolicy::ExcludeOriginator,
            ..ServerConfig::default()
        })
        .await;
        let mut a = TestClient::connect(server.addr).await;
        let mut b = TestClient::connect(server.addr).await;
        let a_id = a.id;
        let b_id = b.id;

        // Drain the join snapshot that announced B.
        a.snapshot_where(|p| p.contains_key(&b_id)).await;

        a.move_to(6, 6).await;
        b.snapshot_where(|p| p.get(&a_id).map(|s| s.position()) == Some(at(6, 6)))
            .await;

        // A's next snapshot must come from B's update, not its own.
        b.move_to(2, 2).await;
        let players = a.snapshot_where(|_| true).await;
        assert_eq!(players[&b_id].position(), at(2, 2));
        assert_eq!(players[&a_id].position(), at(6, 6));

        server.stop().await;
    }
}

/// CONTROL SURFACE TESTS
mod control_tests {
    use super::*;

    /// Kick closes the socket, removes the session and later snapshots omit it
    #[tokio::test]
    async fn kick_player() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut a = TestClient::connect(server.addr).await;
        let mut b = TestClient::connect(server.addr).await;
        let b_id = b.id;
        server.wait_for_players(|p| p.len() == 2).await;

        assert_ok!(server.control.kick_player(&b_id).await);
        b.expect_closed().await;
        assert!(server.control.list_players().await.iter().all(|e| e.id != b_id));

        a.move_to(3, 3).await;
        let players = a.snapshot_where(|p| p.len() == 1).await;
        assert!(!players.contains_key(&b_id));

        assert!(server.control.kick_player(&b_id).await.is_err());
        server.stop().await;
    }

    /// Broadcast text and map replacement reach connected clients
    #[tokio::test]
    async fn broadcast_message_and_replace_map() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut a = TestClient::connect(server.addr).await;

        assert_eq!(server.control.broadcast_message("welcome to the club").await.unwrap(), 1);
        let map = TileMap::new(vec![vec![0, 1], vec![1, 0]]).unwrap();
        assert_eq!(server.control.replace_world_config(map.clone()).await, 1);

        let mut got_text = false;
        let mut got_map = false;
        while !(got_text && got_map) {
            match a.recv().await {
                Some(ServerMessage::Message { text }) => {
                    assert_eq!(text, "welcome to the club");
                    got_text = true;
                }
                Some(ServerMessage::World { grid }) => {
                    assert_eq!(grid, map);
                    got_map = true;
                }
                Some(_) => {}
                None => panic!("connection closed"),
            }
        }

        // New clients are welcomed with the replacement map.
        let late = TestClient::connect(server.addr).await;
        assert_eq!(late.world, map);

        server.stop().await;
    }

    /// The admin channel drives the same operations over TCP
    #[tokio::test]
    async fn admin_channel() {
        let server = TestServer::start(ServerConfig {
            admin_addr: Some("127.0.0.1:0".to_string()),
            ..ServerConfig::default()
        })
        .await;
        let mut player = TestClient::connect(server.addr).await;
        let player_id = player.id;

        let admin_addr = server.admin_addr.expect("admin listener");
        let stream = TcpStream::connect(admin_addr).await.unwrap();
        let mut admin: Framed<_, MessageCodec<ControlReply, ControlRequest>> =
            Framed::new(stream, MessageCodec::new());

        admin.send(ControlRequest::ListPlayers).await.unwrap();
        match timeout(WAIT, admin.next()).await.unwrap() {
            Some(Ok(ControlReply::Players { players })) => {
                assert_eq!(players.len(), 1);
                assert_eq!(players[0].id, player_id);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        admin
            .send(ControlRequest::Kick { id: player_id })
            .await
            .unwrap();
        let reply = timeout(WAIT, admin.next()).await.unwrap();
        assert!(matches!(reply, Some(Ok(ControlReply::Ok))));
        player.expect_closed().await;

        // Garbage is answered with an error, then the admin link is closed.
        let mut raw = admin.into_inner();
        let junk = b"exec('kick all')";
        raw.write_all(&(junk.len() as u32).to_be_bytes()).await.unwrap();
        raw.write_all(junk).await.unwrap();
        let mut admin: Framed<_, MessageCodec<ControlReply, ControlRequest>> =
            Framed::new(raw, MessageCodec::new());
        let reply = timeout(WAIT, admin.next()).await.unwrap();
        assert!(matches!(reply, Some(Ok(ControlReply::Error { .. }))));
        assert!(matches!(timeout(WAIT, admin.next()).await.unwrap(), None | Some(Err(_))));

        server.stop().await;
    }
}

/// ERROR HANDLING TESTS
mod error_tests {
    use super::*;

    /// A malformed payload terminates only the offending connection
    #[tokio::test]
    async fn malformed_payload_isolated() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut good = TestClient::connect(server.addr).await;
        let mut bad = TestClient::connect(server.addr).await;
        let bad_id = bad.id;
        server.wait_for_players(|p| p.len() == 2).await;

        let stream = bad.frames.get_mut();
        let junk = b"{\"type\":\"update\",\"position\":\"__import__('os')\"}";
        stream.write_all(&(junk.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(junk).await.unwrap();

        bad.expect_closed().await;
        good.snapshot_where(|p| !p.contains_key(&bad_id)).await;

        good.move_to(8, 1).await;
        good.snapshot_where(|p| p.len() == 1).await;

        server.stop().await;
    }

    /// Oversized frames are rejected before being buffered
    #[tokio::test]
    async fn oversized_frame_rejected() {
        let server = TestServer::start(ServerConfig {
            max_frame_length: 1024,
            ..ServerConfig::default()
        })
        .await;
        let mut client = TestClient::connect(server.addr).await;

        let stream = client.frames.get_mut();
        stream.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();

        client.expect_closed().await;
        server.wait_for_players(|p| p.is_empty()).await;

        server.stop().await;
    }

    /// Names beyond the limit fail validation and close the connection
    #[tokio::test]
    async fn overlong_name_rejected() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut client = TestClient::connect(server.addr).await;

        client
            .send(ClientMessage::Update {
                position: at(0, 0),
                name: Some("x".repeat(100)),
            })
            .await;

        client.expect_closed().await;
        server.wait_for_players(|p| p.is_empty()).await;

        server.stop().await;
    }

    /// Binding an address already in use fails up front
    #[tokio::test]
    async fn bind_conflict_is_fatal() {
        let server = TestServer::start(ServerConfig::default()).await;
        let result = Server::bind(ServerConfig {
            bind_addr: server.addr.to_string(),
            ..ServerConfig::default()
        })
        .await;
        assert!(matches!(
            result,
            Err(overworld_server::ServerError::Bind { .. })
        ));

        server.stop().await;
    }
}

/// STRESS AND SHUTDOWN TESTS
mod stress_tests {
    use super::*;

    /// 50 clients × 100 updates: no lost or duplicated ids, no deadlock,
    /// bounded shutdown
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_clients_rapid_updates() {
        const CLIENTS: i32 = 50;
        const UPDATES: i32 = 100;
        let settle = Duration::from_secs(30);

        let server = TestServer::start(ServerConfig {
            outbound_queue: 16_384,
            ..ServerConfig::default()
        })
        .await;

        let mut clients = Vec::new();
        for _ in 0..CLIENTS {
            clients.push(TestClient::connect(server.addr).await);
        }
        server
            .wait_for_players(|p| p.len() == CLIENTS as usize)
            .await;

        let mut ids = Vec::new();
        let mut senders = Vec::new();
        let mut readers = Vec::new();
        for (n, client) in clients.into_iter().enumerate() {
            ids.push(client.id);
            let (read_half, write_half) = client.frames.into_parts().io.into_split();
            let mut sink: FramedWrite<_, MessageCodec<ServerMessage, ClientMessage>> =
                FramedWrite::new(write_half, MessageCodec::new());
            senders.push(tokio::spawn(async move {
                for step in 0..UPDATES {
                    sink.send(ClientMessage::update(n as i32, step)).await?;
                }
                Ok::<_, overworld_shared::CodecError>(sink)
            }));
            // Drain raw bytes so no outbound queue backs up.
            readers.push(tokio::spawn(async move {
                let mut read_half = read_half;
                let mut buf = vec![0u8; 64 * 1024];
                let mut received = 0usize;
                while let Ok(n) = read_half.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    received += n;
                }
                received
            }));
        }

        let mut sinks = Vec::new();
        for sender in senders {
            sinks.push(sender.await.unwrap().expect("send updates"));
        }

        // Every handler eventually applies its client's last update.
        let expected: BTreeMap<_, _> = ids
            .iter()
            .enumerate()
            .map(|(n, id)| (*id, at(n as i32, UPDATES - 1)))
            .collect();
        server
            .wait_for_players_within(settle, |players| {
                players.len() == expected.len()
                    && players
                        .iter()
                        .all(|e| expected.get(&e.id) == Some(&e.state.position()))
            })
            .await;

        let listed = server.control.list_players().await;
        let mut unique: Vec<_> = listed.iter().map(|e| e.id).collect();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), CLIENTS as usize);

        // Shutdown mid-session: every handler terminates and closes its socket.
        let started = Instant::now();
        server.stop().await;
        assert!(started.elapsed() < WAIT);

        for reader in readers {
            let received = timeout(settle, reader)
                .await
                .expect("client never saw its connection close")
                .unwrap();
            assert!(received > 0);
        }
        drop(sinks);
    }

    /// Shutdown with idle connected clients completes promptly
    #[tokio::test]
    async fn shutdown_closes_all_sockets() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(TestClient::connect(server.addr).await);
        }
        server.wait_for_players(|p| p.len() == 5).await;

        let control = server.control.clone();
        server.stop().await;
        assert!(control.is_shutting_down());
        assert!(control.list_players().await.is_empty());

        for client in clients.iter_mut() {
            client.expect_closed().await;
        }
    }
}
