pub mod archive;
pub mod auth;
pub mod presence;
pub mod session;

pub use archive::{InMemoryArchive, MessageArchive, DEFAULT_HISTORY_LIMIT};
pub use auth::{validate_username, CredentialVerifier, InMemoryDirectory};
pub use presence::{PresenceRegistry, Registration};
pub use session::SessionManager;
