mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use chatfleet_core::service::{InMemoryArchive, InMemoryDirectory};
use chatfleet_core::store::{MemoryStore, RedisStore, SharedStore};
use chatfleet_core::{logging, Config};

use server::ChatFleetServer;

#[derive(Parser, Debug)]
#[command(name = "chatfleet", about = "Chat relay worker")]
struct Args {
    /// Path to the configuration file
    #[arg(long, short, env = "CHATFLEET_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!("Configuration validation failed with {} error(s)", errors.len());
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    let worker_id = config.worker.resolve_id();
    info!(worker_id = %worker_id, "chatfleet worker starting");
    info!("Client address: {}", config.listen_address());
    info!("Admin address: {}", config.admin_address());

    // 3. Shared store
    let store: Arc<dyn SharedStore> = if config.redis.url.is_empty() {
        warn!("redis.url is empty, running single-process with an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        let store = RedisStore::connect(&config.redis.url, config.redis.operation_timeout())
            .await
            .context("Failed to connect to Redis")?;
        info!("Connected to Redis");
        Arc::new(store)
    };

    // 4. Persistent store boundaries
    // TODO: replace both with implementations backed by the persistent user
    // store once it is reachable from workers; data here is per process
    warn!("Using the in-memory account directory, accounts are not shared between workers");
    let verifier = Arc::new(InMemoryDirectory::new());
    warn!("Using the in-memory message archive, history is not shared between workers");
    let archive = Arc::new(InMemoryArchive::new());

    // 5. Run until drained
    ChatFleetServer::new(config, worker_id, store, verifier, archive)
        .start()
        .await
}
