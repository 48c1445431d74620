pub mod identity;
pub mod message;
pub mod presence;

pub use identity::{Identity, SessionRecord};
pub use message::{ChatMessage, PendingMessage, RoutingEvent};
pub use presence::{PresenceEntry, PresenceEvent, PresenceEventKind};
