pub mod admin;
pub mod connection;
pub mod context;
pub mod lifecycle;
pub mod server;

pub use admin::{create_admin_router, serve_admin};
pub use context::{ConnectionSettings, WorkerContext};
pub use lifecycle::{Lifecycle, WorkerState};
pub use server::{DrainSettings, WorkerServer};
