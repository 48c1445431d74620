use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chatfleet_core::models::{ChatMessage, PresenceEntry, RoutingEvent};
use chatfleet_core::protocol::{DeliveryStatus, ServerFrame};
use chatfleet_core::service::{MessageArchive, PresenceRegistry};
use chatfleet_core::store::{SharedStore, CHAT_CHANNEL};
use chatfleet_core::Result;
use serde::Serialize;
use tracing::{debug, warn};

use super::connection_manager::{ConnectionManager, Delivery};
use super::dedup::MessageDeduplicator;
use super::pending::PendingQueue;

/// Where a message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to a connection on this worker
    Delivered,
    /// Published for the worker that owns the recipient
    Relayed,
    /// Saved in the recipient's pending queue
    Queued { dropped: usize },
}

impl SendOutcome {
    #[must_use]
    pub const fn status(self) -> DeliveryStatus {
        match self {
            Self::Delivered | Self::Relayed => DeliveryStatus::Delivered,
            Self::Queued { .. } => DeliveryStatus::Queued,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: String,
    pub outcome: SendOutcome,
}

#[derive(Debug, Default)]
pub struct RouterMetrics {
    delivered: AtomicU64,
    relayed: AtomicU64,
    queued: AtomicU64,
    overflow_dropped: AtomicU64,
    degraded: AtomicU64,
    duplicates: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub delivered: u64,
    pub relayed: u64,
    pub queued: u64,
    /// Pending messages dropped because a recipient's queue was full
    pub overflow_dropped: u64,
    /// Relays that fell back to the pending queue
    pub degraded: u64,
    pub duplicates: u64,
}

impl RouterMetrics {
    #[must_use]
    pub fn snapshot(&self) -> RouterStats {
        RouterStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

/// Routes direct messages to their recipient.
///
/// Every message is archived first. Recipients connected here get the
/// message directly, recipients owned by another worker get it through the
/// fan-out channel, everyone else gets it in their pending queue. When the
/// fan-out channel is unreachable or has no listeners the message is queued
/// instead of dropped.
pub struct MessageRouter {
    worker_id: String,
    store: Arc<dyn SharedStore>,
    presence: PresenceRegistry,
    connections: ConnectionManager,
    pending: PendingQueue,
    dedup: MessageDeduplicator,
    archive: Arc<dyn MessageArchive>,
    metrics: RouterMetrics,
}

impl MessageRouter {
    #[must_use]
    pub fn new(
        worker_id: String,
        store: Arc<dyn SharedStore>,
        presence: PresenceRegistry,
        connections: ConnectionManager,
        pending: PendingQueue,
        dedup: MessageDeduplicator,
        archive: Arc<dyn MessageArchive>,
    ) -> Self {
        Self {
            worker_id,
            store,
            presence,
            connections,
            pending,
            dedup,
            archive,
            metrics: RouterMetrics::default(),
        }
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    #[must_use]
    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    pub async fn send(&self, from: &str, to: &str, body: &str) -> Result<SendReceipt> {
        let message = ChatMessage::new(from, body);
        let message_id = message.message_id.clone();

        // Delivery does not depend on the archive
        if let Err(e) = self.archive.record(to, &message).await {
            warn!(
                error = %e,
                to = %to,
                message_id = %message_id,
                "Failed to archive message"
            );
        }
        let outcome = self.route(to, message).await?;

        debug!(
            from = %from,
            to = %to,
            message_id = %message_id,
            outcome = ?outcome,
            "Message routed"
        );
        Ok(SendReceipt {
            message_id,
            outcome,
        })
    }

    pub async fn route(&self, target: &str, message: ChatMessage) -> Result<SendOutcome> {
        match self.presence.lookup(target).await? {
            Some(owner) if owner.is_owned_by(&self.worker_id) => {
                match self.deliver_local(target, message.clone()) {
                    Delivery::Delivered => Ok(SendOutcome::Delivered),
                    other => {
                        debug!(
                            target_user = %target,
                            delivery = ?other,
                            "Local recipient not reachable, queueing"
                        );
                        self.enqueue(target, message).await
                    }
                }
            }
            Some(owner) => self.relay(&owner, message).await,
            None => self.enqueue(target, message).await,
        }
    }

    /// Deliver to a connection on this worker, dropping duplicates.
    pub fn deliver_local(&self, target: &str, message: ChatMessage) -> Delivery {
        if self.dedup.is_duplicate(target, &message.message_id) {
            debug!(
                target_user = %target,
                message_id = %message.message_id,
                "Dropping duplicate message"
            );
            self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
            return Delivery::Delivered;
        }

        let message_id = message.message_id.clone();
        let result = self.connections.deliver(target, ServerFrame::Message(message));
        if result == Delivery::Delivered {
            self.dedup.mark_delivered(target, &message_id);
            self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Handle a message relayed to this worker. A recipient whose connection
    /// is not registered here (yet) gets it queued for the next flush.
    pub async fn accept_relayed(&self, event: RoutingEvent) -> Result<()> {
        let target = event.target_username;
        match self.deliver_local(&target, event.payload.clone()) {
            Delivery::Delivered => Ok(()),
            delivery => {
                debug!(
                    target_user = %target,
                    origin_worker_id = %event.origin_worker_id,
                    delivery = ?delivery,
                    "Relayed message not deliverable, queueing"
                );
                self.enqueue(&target, event.payload).await.map(|_| ())
            }
        }
    }

    /// Read and clear the user's pending queue, oldest first, skipping
    /// messages this worker already delivered.
    ///
    /// The caller reports each message with [`Self::mark_flushed`] once it is
    /// written and hands the rest back to [`Self::requeue`].
    pub async fn take_pending(&self, username: &str) -> Result<Vec<ChatMessage>> {
        let messages = self.pending.take(username).await?;
        let mut fresh = Vec::with_capacity(messages.len());

        for message in messages {
            if self.dedup.is_duplicate(username, &message.message_id) {
                self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            fresh.push(message);
        }

        if !fresh.is_empty() {
            debug!(username = %username, count = fresh.len(), "Flushing pending messages");
        }
        Ok(fresh)
    }

    pub fn mark_flushed(&self, username: &str, message_id: &str) {
        self.dedup.mark_delivered(username, message_id);
        self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Put messages that could not be flushed back into the pending queue.
    pub async fn requeue(&self, username: &str, messages: Vec<ChatMessage>) -> Result<()> {
        let count = messages.len();
        for message in messages {
            self.pending.enqueue(username, message).await?;
        }
        if count > 0 {
            debug!(username = %username, count, "Requeued unflushed messages");
        }
        Ok(())
    }

    /// Archived conversation between `username` and `other`, oldest first.
    pub async fn history(
        &self,
        username: &str,
        other: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        self.archive.conversation(username, other, limit).await
    }

    async fn relay(&self, owner: &PresenceEntry, message: ChatMessage) -> Result<SendOutcome> {
        let event = RoutingEvent {
            target_username: owner.username.clone(),
            payload: message,
            origin_worker_id: self.worker_id.clone(),
            target_worker_id: owner.worker_id.clone(),
        };
        let payload = serde_json::to_string(&event)?;

        match self.store.publish(CHAT_CHANNEL, &payload).await {
            Ok(0) => {
                warn!(
                    target_user = %owner.username,
                    owner_worker_id = %owner.worker_id,
                    "No fan-out subscribers, queueing message"
                );
            }
            Ok(receivers) => {
                debug!(
                    target_user = %owner.username,
                    owner_worker_id = %owner.worker_id,
                    receivers,
                    "Message relayed"
                );
                self.metrics.relayed.fetch_add(1, Ordering::Relaxed);
                return Ok(SendOutcome::Relayed);
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    error = %e,
                    target_user = %owner.username,
                    "Fan-out unavailable, queueing message"
                );
            }
            Err(e) => return Err(e),
        }

        self.metrics.degraded.fetch_add(1, Ordering::Relaxed);
        self.enqueue(&owner.username, event.payload).await
    }

    async fn enqueue(&self, target: &str, message: ChatMessage) -> Result<SendOutcome> {
        let dropped = self.pending.enqueue(target, message).await?;
        self.metrics.queued.fetch_add(1, Ordering::Relaxed);
        if dropped > 0 {
            self.metrics
                .overflow_dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        Ok(SendOutcome::Queued { dropped })
    }
}
