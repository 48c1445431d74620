use std::sync::Arc;
use std::time::Duration;

use chatfleet_cluster::{
    ClusterSubscriber, ConnectionManager, MessageDeduplicator, MessageRouter, PendingQueue,
};
use chatfleet_core::service::{
    CredentialVerifier, MessageArchive, PresenceRegistry, SessionManager,
};
use chatfleet_core::store::SharedStore;
use chatfleet_core::{Config, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::Lifecycle;

/// Per-connection limits and timings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_frame_bytes: usize,
    pub outgoing_queue_capacity: usize,
    /// Longest a single write to the client may take
    pub write_timeout: Duration,
}

/// Everything a worker shares between its connections.
#[derive(Clone)]
pub struct WorkerContext {
    pub worker_id: String,
    pub store: Arc<dyn SharedStore>,
    pub presence: PresenceRegistry,
    pub sessions: SessionManager,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub archive: Arc<dyn MessageArchive>,
    pub connections: ConnectionManager,
    pub router: Arc<MessageRouter>,
    pub lifecycle: Lifecycle,
    pub settings: ConnectionSettings,
}

impl WorkerContext {
    /// Wire up the worker services. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(
        config: &Config,
        worker_id: String,
        store: Arc<dyn SharedStore>,
        verifier: Arc<dyn CredentialVerifier>,
        archive: Arc<dyn MessageArchive>,
    ) -> Self {
        let presence = PresenceRegistry::new(
            store.clone(),
            Duration::from_secs(config.presence.ttl_seconds),
        );
        let sessions = SessionManager::new(
            store.clone(),
            Duration::from_secs(config.session.ttl_seconds),
        );
        let pending = PendingQueue::new(
            store.clone(),
            config.pending.capacity,
            Duration::from_secs(config.pending.ttl_seconds),
        );
        let dedup = MessageDeduplicator::new(
            Duration::from_secs(config.routing.dedup_window_seconds),
            Duration::from_secs(config.routing.dedup_cleanup_seconds),
        );
        let connections = ConnectionManager::new();
        let router = Arc::new(MessageRouter::new(
            worker_id.clone(),
            store.clone(),
            presence.clone(),
            connections.clone(),
            pending,
            dedup,
            archive.clone(),
        ));

        Self {
            worker_id,
            store,
            presence,
            sessions,
            verifier,
            archive,
            connections,
            router,
            lifecycle: Lifecycle::new(),
            settings: ConnectionSettings {
                max_frame_bytes: config.server.max_frame_bytes,
                outgoing_queue_capacity: config.server.outgoing_queue_capacity,
                write_timeout: Duration::from_secs(config.server.write_timeout_seconds),
            },
        }
    }

    /// Start listening to the cluster channels. Stops when `cancel` fires.
    pub async fn start_cluster_subscriber(
        &self,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        let subscriber = Arc::new(ClusterSubscriber::new(
            self.store.clone(),
            self.router.clone(),
            self.connections.clone(),
            cancel,
        ));
        subscriber.start().await
    }
}
