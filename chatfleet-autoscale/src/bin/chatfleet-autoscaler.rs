use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chatfleet_autoscale::{Autoscaler, KubernetesOrchestrator, ScalePolicy};
use chatfleet_core::service::PresenceRegistry;
use chatfleet_core::shutdown::shutdown_signal;
use chatfleet_core::store::RedisStore;
use chatfleet_core::{logging, Config};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chatfleet-autoscaler", about = "Sizes the chatfleet worker deployment")]
struct Args {
    /// Path to the configuration file
    #[arg(long, short, env = "CHATFLEET_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!("Configuration validation failed with {} error(s)", errors.len());
    }

    logging::init_logging(&config.logging)?;
    info!(
        namespace = %config.autoscaler.namespace,
        deployment = %config.autoscaler.deployment,
        "chatfleet autoscaler starting"
    );

    // Occupancy is read from the store the workers share; there is no
    // single-process fallback here
    anyhow::ensure!(
        !config.redis.url.is_empty(),
        "The autoscaler needs redis.url to read the online count"
    );
    let store = RedisStore::connect(&config.redis.url, config.redis.operation_timeout())
        .await
        .context("Failed to connect to Redis")?;
    let presence = PresenceRegistry::new(
        Arc::new(store),
        Duration::from_secs(config.presence.ttl_seconds),
    );

    let orchestrator = KubernetesOrchestrator::from_config(&config.autoscaler)
        .await
        .context("Failed to set up the Kubernetes client")?;

    let cancel = CancellationToken::new();
    let autoscaler = Autoscaler::new(
        presence,
        Arc::new(orchestrator),
        ScalePolicy::from_config(&config.autoscaler),
    );
    let task = tokio::spawn(autoscaler.run(
        Duration::from_secs(config.autoscaler.interval_seconds),
        cancel.clone(),
    ));

    shutdown_signal().await;
    cancel.cancel();
    task.await.context("Autoscaler task failed")?;

    info!("chatfleet autoscaler stopped");
    Ok(())
}
