use std::sync::Arc;

use chatfleet_core::models::{PresenceEvent, PresenceEventKind, RoutingEvent};
use chatfleet_core::protocol::ServerFrame;
use chatfleet_core::store::{SharedStore, CHAT_CHANNEL, PRESENCE_CHANNEL};
use chatfleet_core::Result;
use futures::stream::{BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection_manager::ConnectionManager;
use super::router::MessageRouter;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    Chat,
    Presence,
}

impl Feed {
    const fn channel(self) -> &'static str {
        match self {
            Self::Chat => CHAT_CHANNEL,
            Self::Presence => PRESENCE_CHANNEL,
        }
    }
}

/// Reason a subscription loop stopped consuming its stream.
enum SubscriberExit {
    /// The stream ended, the connection is gone
    Disconnected,
    Cancelled,
}

/// Listens to the cluster channels on behalf of this worker.
///
/// Routing events addressed to this worker are delivered locally, or queued
/// when the recipient is not connected here; the rest are ignored. Presence
/// events announcing that another worker accepted a login for one of our
/// users close the older local connection.
pub struct ClusterSubscriber {
    worker_id: String,
    store: Arc<dyn SharedStore>,
    router: Arc<MessageRouter>,
    connections: ConnectionManager,
    cancel_token: CancellationToken,
}

impl ClusterSubscriber {
    #[must_use]
    pub fn new(
        store: Arc<dyn SharedStore>,
        router: Arc<MessageRouter>,
        connections: ConnectionManager,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            worker_id: router.worker_id().to_string(),
            store,
            router,
            connections,
            cancel_token,
        }
    }

    /// Subscribe to both channels and spawn their consumer tasks.
    ///
    /// The first subscription happens before this returns, so messages
    /// published afterwards reach this worker. Later disconnects are retried
    /// with exponential backoff until the token is cancelled.
    pub async fn start(self: Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let chat = self.store.subscribe(Feed::Chat.channel()).await?;
        let presence = self.store.subscribe(Feed::Presence.channel()).await?;
        info!(worker_id = %self.worker_id, "Subscribed to cluster channels");

        Ok(vec![
            tokio::spawn(Arc::clone(&self).run(Feed::Chat, chat)),
            tokio::spawn(self.run(Feed::Presence, presence)),
        ])
    }

    async fn run(self: Arc<Self>, feed: Feed, mut stream: BoxStream<'static, String>) {
        loop {
            match self.consume(feed, &mut stream).await {
                SubscriberExit::Cancelled => {
                    info!(channel = feed.channel(), "Cluster subscriber cancelled");
                    return;
                }
                SubscriberExit::Disconnected => {
                    error!(channel = feed.channel(), "Subscription stream ended, reconnecting");
                }
            }

            match self.resubscribe(feed).await {
                Some(next) => stream = next,
                None => return,
            }
        }
    }

    async fn resubscribe(&self, feed: Feed) -> Option<BoxStream<'static, String>> {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => return None,
                () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }

            match self.store.subscribe(feed.channel()).await {
                Ok(stream) => {
                    info!(channel = feed.channel(), "Resubscribed to cluster channel");
                    return Some(stream);
                }
                Err(e) => {
                    error!(
                        error = %e,
                        channel = feed.channel(),
                        backoff_secs,
                        "Failed to resubscribe, retrying after backoff"
                    );
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }
    }

    async fn consume(&self, feed: Feed, stream: &mut BoxStream<'static, String>) -> SubscriberExit {
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => return SubscriberExit::Cancelled,
                item = stream.next() => match item {
                    Some(payload) => self.dispatch(feed, &payload).await,
                    None => return SubscriberExit::Disconnected,
                },
            }
        }
    }

    async fn dispatch(&self, feed: Feed, payload: &str) {
        match feed {
            Feed::Chat => match serde_json::from_str::<RoutingEvent>(payload) {
                Ok(event) => self.handle_routing(event).await,
                Err(e) => warn!(error = %e, "Failed to deserialize routing event"),
            },
            Feed::Presence => match serde_json::from_str::<PresenceEvent>(payload) {
                Ok(event) => self.handle_presence(&event),
                Err(e) => warn!(error = %e, "Failed to deserialize presence event"),
            },
        }
    }

    async fn handle_routing(&self, event: RoutingEvent) {
        // Events from older senders carry no target worker
        let addressed_here = if event.target_worker_id.is_empty() {
            self.connections.contains(&event.target_username)
        } else {
            event.target_worker_id == self.worker_id
        };
        if !addressed_here {
            return;
        }

        debug!(
            target_user = %event.target_username,
            origin_worker_id = %event.origin_worker_id,
            "Delivering relayed message"
        );
        let target = event.target_username.clone();
        if let Err(e) = self.router.accept_relayed(event).await {
            warn!(error = %e, target_user = %target, "Failed to queue relayed message");
        }
    }

    fn handle_presence(&self, event: &PresenceEvent) {
        if event.kind != PresenceEventKind::Joined || event.worker_id == self.worker_id {
            return;
        }
        let Some(handle) = self.connections.get(&event.username) else {
            return;
        };
        // A login here that is newer than the announcement stays
        if handle.presence.login_time > event.at {
            return;
        }

        info!(
            username = %event.username,
            new_worker_id = %event.worker_id,
            "Closing connection taken over by another worker"
        );
        handle.close_with(ServerFrame::Evicted);
    }
}
