pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod protocol;
pub mod service;
pub mod shutdown;
pub mod store;

pub use crate::config::Config;
pub use error::{Error, Result};
