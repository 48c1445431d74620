// Module: sync

pub mod connection_manager;
pub mod dedup;
pub mod fanout;
pub mod pending;
pub mod router;

pub use connection_manager::{ConnectionHandle, ConnectionManager, ConnectionMetrics, Delivery};
pub use dedup::MessageDeduplicator;
pub use fanout::ClusterSubscriber;
pub use pending::PendingQueue;
pub use router::{MessageRouter, RouterMetrics, RouterStats, SendOutcome, SendReceipt};
