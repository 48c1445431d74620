pub mod sync;

pub use sync::{
    ClusterSubscriber, ConnectionHandle, ConnectionManager, MessageDeduplicator, MessageRouter,
    PendingQueue, SendOutcome,
};
