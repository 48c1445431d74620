//! Worker lifecycle: client listener, admin listener, cluster subscriber.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use chatfleet_api::{serve_admin, DrainSettings, WorkerContext, WorkerServer};
use chatfleet_core::service::{CredentialVerifier, MessageArchive};
use chatfleet_core::shutdown::shutdown_signal;
use chatfleet_core::store::SharedStore;
use chatfleet_core::Config;

pub struct ChatFleetServer {
    config: Config,
    ctx: WorkerContext,
}

impl ChatFleetServer {
    pub fn new(
        config: Config,
        worker_id: String,
        store: Arc<dyn SharedStore>,
        verifier: Arc<dyn CredentialVerifier>,
        archive: Arc<dyn MessageArchive>,
    ) -> Self {
        let ctx = WorkerContext::new(&config, worker_id, store, verifier, archive);
        Self { config, ctx }
    }

    /// Serve until a shutdown signal or pre-stop request, then drain.
    pub async fn start(self) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();

        let subscriber_handles = self
            .ctx
            .start_cluster_subscriber(cancel.clone())
            .await
            .context("Failed to subscribe to cluster channels")?;

        let admin_address = self.config.admin_address();
        let admin_listener = TcpListener::bind(&admin_address)
            .await
            .with_context(|| format!("Failed to bind admin address {admin_address}"))?;
        let admin_shutdown = cancel.clone();
        let admin_handle = tokio::spawn(serve_admin(
            admin_listener,
            self.ctx.clone(),
            async move { admin_shutdown.cancelled().await },
        ));

        let listen_address = self.config.listen_address();
        let listener = TcpListener::bind(&listen_address)
            .await
            .with_context(|| format!("Failed to bind client address {listen_address}"))?;

        let server = WorkerServer::new(
            self.ctx.clone(),
            DrainSettings::from_config(&self.config.drain),
        );
        // Returns after the drain, whichever way it was triggered
        server.run(listener, shutdown_signal()).await;

        // Presence is gone by now; stop the background tasks
        cancel.cancel();
        for handle in subscriber_handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Cluster subscriber task failed");
            }
        }
        match admin_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Admin server error"),
            Err(e) => error!(error = %e, "Admin server task failed"),
        }

        info!(worker_id = %self.ctx.worker_id, "chatfleet worker stopped");
        Ok(())
    }
}
