//! Two workers sharing one store, driven by real TCP clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chatfleet_api::{DrainSettings, WorkerContext, WorkerServer, WorkerState};
use chatfleet_core::models::ChatMessage;
use chatfleet_core::protocol::{
    ClientCodec, ClientFrame, DeliveryStatus, RejectReason, ServerFrame,
};
use chatfleet_core::service::{InMemoryArchive, InMemoryDirectory, MessageArchive};
use chatfleet_core::store::MemoryStore;
use chatfleet_core::Config;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestWorker {
    ctx: WorkerContext,
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TestWorker {
    async fn start(
        worker_id: &str,
        store: &Arc<MemoryStore>,
        directory: &Arc<InMemoryDirectory>,
        drain: DrainSettings,
    ) -> Self {
        let archive = Arc::new(InMemoryArchive::new());
        Self::start_with(&Config::default(), archive, worker_id, store, directory, drain).await
    }

    async fn start_with(
        config: &Config,
        archive: Arc<dyn MessageArchive>,
        worker_id: &str,
        store: &Arc<MemoryStore>,
        directory: &Arc<InMemoryDirectory>,
        drain: DrainSettings,
    ) -> Self {
        let ctx = WorkerContext::new(
            config,
            worker_id.to_string(),
            store.clone(),
            directory.clone(),
            archive,
        );
        let shutdown = CancellationToken::new();
        ctx.start_cluster_subscriber(shutdown.clone()).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = WorkerServer::new(ctx.clone(), drain);
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            server.run(listener, signal.cancelled_owned()).await;
        });

        Self {
            ctx,
            addr,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .unwrap()
            .unwrap();
    }
}

fn quick_drain() -> DrainSettings {
    DrainSettings {
        warning: Duration::from_millis(200),
        grace: Duration::from_secs(3),
    }
}

struct TestClient {
    framed: Framed<TcpStream, ClientCodec>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        Self::connect_with_limit(addr, 64 * 1024).await
    }

    async fn connect_with_limit(addr: SocketAddr, max_frame_bytes: usize) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, ClientCodec::new(max_frame_bytes)),
        }
    }

    async fn signup(addr: SocketAddr, username: &str) -> (Self, String) {
        let mut client = Self::connect(addr).await;
        client
            .send(ClientFrame::Signup {
                username: username.to_string(),
                password: "secret".to_string(),
            })
            .await;
        let token = client.expect_accepted().await.0;
        (client, token)
    }

    async fn resume(addr: SocketAddr, token: &str) -> (Self, Vec<ChatMessage>) {
        Self::resume_with_limit(addr, token, 64 * 1024).await
    }

    async fn resume_with_limit(
        addr: SocketAddr,
        token: &str,
        max_frame_bytes: usize,
    ) -> (Self, Vec<ChatMessage>) {
        let mut client = Self::connect_with_limit(addr, max_frame_bytes).await;
        client
            .send(ClientFrame::Resume {
                token: token.to_string(),
            })
            .await;
        let pending = client.expect_accepted().await.1;
        (client, pending)
    }

    async fn send(&mut self, frame: ClientFrame) {
        self.framed.send(frame).await.unwrap();
    }

    /// Next frame, or `None` once the worker closed the connection.
    async fn next(&mut self) -> Option<ServerFrame> {
        let item = tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a frame");
        match item {
            Some(Ok(Ok(frame))) => Some(frame),
            Some(Ok(Err(e))) => panic!("undecodable frame: {e}"),
            Some(Err(_)) | None => None,
        }
    }

    async fn recv(&mut self) -> ServerFrame {
        self.next().await.expect("connection closed")
    }

    /// The acceptance and the queued messages that follow it.
    async fn expect_accepted(&mut self) -> (String, Vec<ChatMessage>) {
        let (token, count) = match self.recv().await {
            ServerFrame::Accepted { token, pending, .. } => (token, pending),
            other => panic!("expected accepted, got {other:?}"),
        };
        let mut pending = Vec::with_capacity(count);
        for _ in 0..count {
            match self.recv().await {
                ServerFrame::Message(message) => pending.push(message),
                other => panic!("expected a queued message, got {other:?}"),
            }
        }
        (token, pending)
    }

    async fn expect_closed(&mut self) {
        while let Some(frame) = self.next().await {
            assert!(
                !matches!(frame, ServerFrame::Accepted { .. }),
                "unexpected frame before close: {frame:?}"
            );
        }
    }
}

async fn wait_until_offline(ctx: &WorkerContext, username: &str) {
    for _ in 0..100 {
        if ctx.presence.lookup(username).await.unwrap().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{username} still has a presence entry");
}

#[tokio::test]
async fn test_offline_message_is_flushed_on_resume_elsewhere() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let p1 = TestWorker::start("worker-1", &store, &directory, quick_drain()).await;
    let p2 = TestWorker::start("worker-2", &store, &directory, quick_drain()).await;

    let (bob, bob_token) = TestClient::signup(p2.addr, "bob").await;
    drop(bob);
    wait_until_offline(&p2.ctx, "bob").await;

    let (mut alice, _) = TestClient::signup(p1.addr, "alice").await;
    alice
        .send(ClientFrame::Send {
            to: "bob".to_string(),
            body: "are you there?".to_string(),
        })
        .await;
    match alice.recv().await {
        ServerFrame::Sent { to, status, .. } => {
            assert_eq!(to, "bob");
            assert_eq!(status, DeliveryStatus::Queued);
        }
        other => panic!("expected sent, got {other:?}"),
    }

    let (_bob, pending) = TestClient::resume(p2.addr, &bob_token).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].from, "alice");
    assert_eq!(pending[0].body, "are you there?");

    p1.stop().await;
    p2.stop().await;
}

#[tokio::test]
async fn test_message_is_relayed_to_other_worker() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let p1 = TestWorker::start("worker-1", &store, &directory, quick_drain()).await;
    let p2 = TestWorker::start("worker-2", &store, &directory, quick_drain()).await;

    let (mut alice, _) = TestClient::signup(p1.addr, "alice").await;
    let (mut bob, _) = TestClient::signup(p2.addr, "bob").await;

    alice
        .send(ClientFrame::Send {
            to: "bob".to_string(),
            body: "hello from worker-1".to_string(),
        })
        .await;
    let message_id = match alice.recv().await {
        ServerFrame::Sent {
            status, message_id, ..
        } => {
            assert_eq!(status, DeliveryStatus::Delivered);
            message_id
        }
        other => panic!("expected sent, got {other:?}"),
    };

    match bob.recv().await {
        ServerFrame::Message(message) => {
            assert_eq!(message.message_id, message_id);
            assert_eq!(message.from, "alice");
            assert_eq!(message.body, "hello from worker-1");
        }
        other => panic!("expected message, got {other:?}"),
    }

    bob.send(ClientFrame::ListOnline).await;
    assert_eq!(
        bob.recv().await,
        ServerFrame::Online {
            users: vec!["alice".to_string(), "bob".to_string()]
        }
    );

    p1.stop().await;
    p2.stop().await;
}

#[tokio::test]
async fn test_drain_warns_closes_and_clears_presence() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let p1 = TestWorker::start("worker-1", &store, &directory, quick_drain()).await;

    let (mut alice, _) = TestClient::signup(p1.addr, "alice").await;
    for _ in 0..100 {
        if p1.ctx.connections.contains("alice") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(p1.ctx.lifecycle.request_drain());

    match alice.recv().await {
        ServerFrame::Maintenance { reconnect_after_ms } => assert_eq!(reconnect_after_ms, 200),
        other => panic!("expected maintenance notice, got {other:?}"),
    }
    alice.expect_closed().await;

    tokio::time::timeout(Duration::from_secs(5), p1.ctx.lifecycle.closed())
        .await
        .unwrap();
    assert_eq!(p1.ctx.lifecycle.state(), WorkerState::Closed);
    assert!(p1.ctx.presence.lookup("alice").await.unwrap().is_none());
    assert_eq!(p1.ctx.connections.connection_count(), 0);

    // The accept loop has stopped
    tokio::time::timeout(Duration::from_secs(5), p1.task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_invalid_resume_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let p1 = TestWorker::start("worker-1", &store, &directory, quick_drain()).await;

    let mut client = TestClient::connect(p1.addr).await;
    client
        .send(ClientFrame::Resume {
            token: "no-such-token".to_string(),
        })
        .await;
    match client.recv().await {
        ServerFrame::Rejected { reason, .. } => assert_eq!(reason, RejectReason::InvalidToken),
        other => panic!("expected rejection, got {other:?}"),
    }

    // Anything but a handshake is refused before login
    client.send(ClientFrame::ListOnline).await;
    assert!(matches!(client.recv().await, ServerFrame::Error { .. }));

    p1.stop().await;
}

#[tokio::test]
async fn test_login_on_other_worker_evicts_old_connection() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let p1 = TestWorker::start("worker-1", &store, &directory, quick_drain()).await;
    let p2 = TestWorker::start("worker-2", &store, &directory, quick_drain()).await;

    let (mut first, token) = TestClient::signup(p1.addr, "alice").await;
    let (_second, _) = TestClient::resume(p2.addr, &token).await;

    assert_eq!(first.recv().await, ServerFrame::Evicted);
    first.expect_closed().await;

    let owner = p2.ctx.presence.lookup("alice").await.unwrap().unwrap();
    assert_eq!(owner.worker_id, "worker-2");

    p1.stop().await;
    p2.stop().await;
}

/// Queue `count` messages for an offline `bob`, each body prefixed with its
/// index.
async fn queue_for_bob(ctx: &WorkerContext, count: usize, body_len: usize) {
    for i in 0..count {
        let body = format!("{i:03}{}", "x".repeat(body_len));
        let receipt = ctx.router.send("alice", "bob", &body).await.unwrap();
        assert_eq!(receipt.outcome.status(), DeliveryStatus::Queued);
    }
}

/// Resume `token` on a socket with a tiny receive window and never read.
async fn stalled_resume(addr: SocketAddr, token: &str) -> Framed<TcpStream, ClientCodec> {
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    let stream = socket.connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, ClientCodec::new(1 << 20));
    framed
        .send(ClientFrame::Resume {
            token: token.to_string(),
        })
        .await
        .unwrap();
    framed
}

#[tokio::test]
async fn test_large_backlog_is_flushed_frame_by_frame() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let p1 = TestWorker::start("worker-1", &store, &directory, quick_drain()).await;

    let (bob, bob_token) = TestClient::signup(p1.addr, "bob").await;
    drop(bob);
    wait_until_offline(&p1.ctx, "bob").await;

    // Together far beyond one 64 KiB frame
    queue_for_bob(&p1.ctx, 100, 1000).await;

    let (mut bob, pending) = TestClient::resume(p1.addr, &bob_token).await;
    assert_eq!(pending.len(), 100);
    for (i, message) in pending.iter().enumerate() {
        assert!(message.body.starts_with(&format!("{i:03}")));
    }

    bob.send(ClientFrame::ListOnline).await;
    assert_eq!(
        bob.recv().await,
        ServerFrame::Online {
            users: vec!["bob".to_string()]
        }
    );

    p1.stop().await;
}

#[tokio::test]
async fn test_drain_closes_connection_stuck_in_handshake() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let mut config = Config::default();
    config.server.max_frame_bytes = 1 << 20;
    let archive = Arc::new(InMemoryArchive::new());
    let p1 = TestWorker::start_with(&config, archive, "worker-1", &store, &directory, quick_drain())
        .await;

    let (bob, bob_token) = TestClient::signup(p1.addr, "bob").await;
    drop(bob);
    wait_until_offline(&p1.ctx, "bob").await;
    queue_for_bob(&p1.ctx, 100, 200_000).await;

    let _stalled = stalled_resume(p1.addr, &bob_token).await;
    for _ in 0..100 {
        if p1.ctx.connections.contains("bob")
            && p1.ctx.presence.lookup("bob").await.unwrap().is_some()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(p1.ctx.connections.contains("bob"));

    assert!(p1.ctx.lifecycle.request_drain());
    tokio::time::timeout(Duration::from_secs(5), p1.ctx.lifecycle.closed())
        .await
        .unwrap();
    assert!(p1.ctx.presence.lookup("bob").await.unwrap().is_none());
    assert_eq!(p1.ctx.connections.connection_count(), 0);
}

#[tokio::test]
async fn test_client_that_stops_reading_is_disconnected() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let mut config = Config::default();
    config.server.max_frame_bytes = 1 << 20;
    config.server.write_timeout_seconds = 1;
    let archive = Arc::new(InMemoryArchive::new());
    let p1 = TestWorker::start_with(&config, archive, "worker-1", &store, &directory, quick_drain())
        .await;

    let (bob, bob_token) = TestClient::signup(p1.addr, "bob").await;
    drop(bob);
    wait_until_offline(&p1.ctx, "bob").await;
    queue_for_bob(&p1.ctx, 100, 200_000).await;

    let stalled = stalled_resume(p1.addr, &bob_token).await;
    for _ in 0..100 {
        if p1.ctx.presence.lookup("bob").await.unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(p1.ctx.connections.contains("bob"));

    for _ in 0..100 {
        if !p1.ctx.connections.contains("bob") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!p1.ctx.connections.contains("bob"));
    assert!(p1.ctx.presence.lookup("bob").await.unwrap().is_none());
    drop(stalled);

    // What the stalled connection never wrote is still queued
    let (_bob, pending) = TestClient::resume_with_limit(p1.addr, &bob_token, 1 << 20).await;
    assert!(!pending.is_empty());
    assert!(pending.last().unwrap().body.starts_with("099"));

    p1.stop().await;
}

#[tokio::test]
async fn test_history_is_served_from_the_shared_archive() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let archive = Arc::new(InMemoryArchive::new());
    let config = Config::default();
    let p1 = TestWorker::start_with(
        &config,
        archive.clone(),
        "worker-1",
        &store,
        &directory,
        quick_drain(),
    )
    .await;
    let p2 = TestWorker::start_with(&config, archive, "worker-2", &store, &directory, quick_drain())
        .await;

    let (mut alice, _) = TestClient::signup(p1.addr, "alice").await;
    let (mut bob, _) = TestClient::signup(p2.addr, "bob").await;

    alice
        .send(ClientFrame::Send {
            to: "bob".to_string(),
            body: "first".to_string(),
        })
        .await;
    assert!(matches!(alice.recv().await, ServerFrame::Sent { .. }));
    assert!(matches!(bob.recv().await, ServerFrame::Message(_)));

    bob.send(ClientFrame::Send {
        to: "alice".to_string(),
        body: "second".to_string(),
    })
    .await;
    assert!(matches!(bob.recv().await, ServerFrame::Sent { .. }));
    assert!(matches!(alice.recv().await, ServerFrame::Message(_)));

    bob.send(ClientFrame::History {
        with: "alice".to_string(),
        limit: None,
    })
    .await;
    match bob.recv().await {
        ServerFrame::History { with, messages } => {
            assert_eq!(with, "alice");
            let bodies: Vec<_> = messages.iter().map(|m| m.body.as_str()).collect();
            assert_eq!(bodies, vec!["first", "second"]);
        }
        other => panic!("expected history, got {other:?}"),
    }

    alice
        .send(ClientFrame::History {
            with: "bob".to_string(),
            limit: Some(1),
        })
        .await;
    match alice.recv().await {
        ServerFrame::History { messages, .. } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].body, "second");
        }
        other => panic!("expected history, got {other:?}"),
    }

    p1.stop().await;
    p2.stop().await;
}

#[tokio::test]
async fn test_oversized_message_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let p1 = TestWorker::start("worker-1", &store, &directory, quick_drain()).await;

    let (mut alice, _) = TestClient::signup(p1.addr, "alice").await;
    // Fits in the client frame, but not once wrapped as a message
    let body = "x".repeat(64 * 1024 - 40);
    alice
        .send(ClientFrame::Send {
            to: "bob".to_string(),
            body,
        })
        .await;
    match alice.recv().await {
        ServerFrame::Error { message } => assert!(message.contains("too long")),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(p1.ctx.router.take_pending("bob").await.unwrap().is_empty());

    p1.stop().await;
}
