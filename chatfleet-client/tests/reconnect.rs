//! A client following its session from a draining worker to its replacement.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chatfleet_api::{DrainSettings, WorkerContext, WorkerServer};
use chatfleet_client::{
    ClientOptions, ClientState, ClientUpdate, Credentials, ReconnectPolicy, ResilientClient,
};
use chatfleet_core::protocol::{ClientFrame, ServerFrame};
use chatfleet_core::service::{InMemoryArchive, InMemoryDirectory};
use chatfleet_core::store::MemoryStore;
use chatfleet_core::Config;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

fn drain() -> DrainSettings {
    DrainSettings {
        warning: Duration::from_millis(200),
        grace: Duration::from_secs(3),
    }
}

fn context(
    worker_id: &str,
    store: &Arc<MemoryStore>,
    directory: &Arc<InMemoryDirectory>,
) -> WorkerContext {
    WorkerContext::new(
        &Config::default(),
        worker_id.to_string(),
        store.clone(),
        directory.clone(),
        Arc::new(InMemoryArchive::new()),
    )
}

fn serve(ctx: &WorkerContext, listener: TcpListener) -> JoinHandle<()> {
    let server = WorkerServer::new(ctx.clone(), drain());
    tokio::spawn(async move {
        server.run(listener, std::future::pending()).await;
    })
}

fn options(addr: SocketAddr) -> ClientOptions {
    ClientOptions {
        server: addr.to_string(),
        policy: ReconnectPolicy {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: 6,
            jitter: false,
        },
        ..ClientOptions::default()
    }
}

fn alice() -> Credentials {
    Credentials {
        username: "alice".to_string(),
        password: "secret".to_string(),
        signup: true,
    }
}

async fn next_update(client: &mut ResilientClient) -> ClientUpdate {
    tokio::time::timeout(Duration::from_secs(10), client.next_update())
        .await
        .expect("timed out waiting for an update")
}

/// Drain a worker and wait until it has released its port.
async fn drain_worker(ctx: &WorkerContext, task: JoinHandle<()>) {
    ctx.lifecycle.request_drain();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_session_survives_worker_replacement() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let first = context("worker-1", &store, &directory);
    let first_task = serve(&first, listener);

    let (mut client, pending) = ResilientClient::connect(options(addr), &alice()).await.unwrap();
    assert!(pending.is_empty());

    let drained = {
        let first = first.clone();
        tokio::spawn(async move { drain_worker(&first, first_task).await })
    };
    match next_update(&mut client).await {
        ClientUpdate::Maintenance { reconnect_after } => {
            assert_eq!(reconnect_after, Duration::from_millis(200));
        }
        other => panic!("expected maintenance, got {other:?}"),
    }
    drained.await.unwrap();
    assert!(first.presence.lookup("alice").await.unwrap().is_none());

    // The replacement takes over the address; bob writes while alice is away
    let second = context("worker-2", &store, &directory);
    let receipt = second.router.send("bob", "alice", "welcome back").await.unwrap();
    assert_eq!(receipt.outcome.status(), chatfleet_core::protocol::DeliveryStatus::Queued);
    let listener = TcpListener::bind(addr).await.unwrap();
    let _second_task = serve(&second, listener);

    match next_update(&mut client).await {
        ClientUpdate::Reconnected { pending } => {
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].from, "bob");
            assert_eq!(pending[0].body, "welcome back");
        }
        other => panic!("expected reconnect, got {other:?}"),
    }
    assert_eq!(client.state(), ClientState::Connected);

    client.send(ClientFrame::ListOnline).await.unwrap();
    assert_eq!(
        next_update(&mut client).await,
        ClientUpdate::Frame(ServerFrame::Online {
            users: vec!["alice".to_string()]
        })
    );
    let owner = second.presence.lookup("alice").await.unwrap().unwrap();
    assert_eq!(owner.worker_id, "worker-2");
}

#[tokio::test]
async fn test_revoked_session_requires_login() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let first = context("worker-1", &store, &directory);
    let first_task = serve(&first, listener);

    let (mut client, _) = ResilientClient::connect(options(addr), &alice()).await.unwrap();
    first.sessions.revoke(client.token()).await.unwrap();

    let drained = {
        let first = first.clone();
        tokio::spawn(async move { drain_worker(&first, first_task).await })
    };
    assert!(matches!(
        next_update(&mut client).await,
        ClientUpdate::Maintenance { .. }
    ));
    drained.await.unwrap();

    let second = context("worker-2", &store, &directory);
    let _second_task = serve(&second, TcpListener::bind(addr).await.unwrap());

    assert_eq!(next_update(&mut client).await, ClientUpdate::LoginRequired);
    assert_eq!(client.state(), ClientState::ReAuth);

    let login = Credentials {
        signup: false,
        ..alice()
    };
    client.login(&login).await.unwrap();
    assert_eq!(client.state(), ClientState::Connected);
}

#[tokio::test]
async fn test_gives_up_when_fleet_is_gone() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = context("worker-1", &store, &directory);
    let task = serve(&ctx, listener);

    let mut options = options(addr);
    options.policy.max_attempts = 2;
    let (mut client, _) = ResilientClient::connect(options, &alice()).await.unwrap();

    let drained = {
        let ctx = ctx.clone();
        tokio::spawn(async move { drain_worker(&ctx, task).await })
    };
    assert!(matches!(
        next_update(&mut client).await,
        ClientUpdate::Maintenance { .. }
    ));
    drained.await.unwrap();

    assert_eq!(next_update(&mut client).await, ClientUpdate::GaveUp);
    assert_eq!(client.state(), ClientState::GaveUp);
}

#[tokio::test]
async fn test_backlog_larger_than_a_frame_arrives_at_login() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = context("worker-1", &store, &directory);
    let _task = serve(&ctx, listener);

    for i in 0..100 {
        let body = format!("{i:03}{}", "x".repeat(1000));
        ctx.router.send("bob", "alice", &body).await.unwrap();
    }

    let (mut client, pending) = ResilientClient::connect(options(addr), &alice()).await.unwrap();
    assert_eq!(pending.len(), 100);
    assert!(pending[0].body.starts_with("000"));
    assert!(pending[99].body.starts_with("099"));

    client.send(ClientFrame::ListOnline).await.unwrap();
    assert_eq!(
        next_update(&mut client).await,
        ClientUpdate::Frame(ServerFrame::Online {
            users: vec!["alice".to_string()]
        })
    );
}
