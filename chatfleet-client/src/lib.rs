pub mod client;
pub mod state;

pub use client::{ClientOptions, ClientUpdate, Credentials, ResilientClient};
pub use state::{ClientState, ReconnectMachine, ReconnectPolicy, Signal};
