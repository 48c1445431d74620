//! Accept loop and graceful drain of a worker.

use std::future::Future;
use std::time::Duration;

use chatfleet_core::protocol::ServerFrame;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::connection::handle_connection;
use crate::context::WorkerContext;
use crate::lifecycle::WorkerState;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct DrainSettings {
    /// How long clients get between the maintenance notice and the close
    pub warning: Duration,
    /// Upper bound on the whole drain
    pub grace: Duration,
}

impl DrainSettings {
    #[must_use]
    pub fn from_config(config: &chatfleet_core::config::DrainConfig) -> Self {
        Self {
            warning: Duration::from_secs(config.warning_seconds),
            grace: Duration::from_secs(config.grace_seconds),
        }
    }
}

pub struct WorkerServer {
    ctx: WorkerContext,
    drain: DrainSettings,
}

impl WorkerServer {
    #[must_use]
    pub fn new(ctx: WorkerContext, drain: DrainSettings) -> Self {
        Self { ctx, drain }
    }

    #[must_use]
    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Accept clients until `shutdown` resolves or a drain is requested,
    /// then drain. Returns once every connection is gone.
    pub async fn run(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        match listener.local_addr() {
            Ok(addr) => info!(address = %addr, worker_id = %self.ctx.worker_id, "Worker listening"),
            Err(e) => warn!(error = %e, "Worker listening on unknown address"),
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(error = %e, "Failed to set TCP_NODELAY");
                        }
                        tokio::spawn(handle_connection(self.ctx.clone(), stream, peer));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                () = self.ctx.lifecycle.drain_requested() => {
                    info!("Drain requested, no longer accepting connections");
                    break;
                }
                () = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }

        // New connections are refused from here on
        drop(listener);
        self.drain().await;
    }

    /// Warn every local client, close their connections and remove their
    /// presence, all within the grace period.
    pub async fn drain(&self) {
        self.ctx.lifecycle.request_drain();
        if self.ctx.lifecycle.state() == WorkerState::Closed {
            return;
        }

        let deadline = tokio::time::Instant::now() + self.drain.grace;
        let connections = &self.ctx.connections;

        let warning = ServerFrame::Maintenance {
            reconnect_after_ms: u64::try_from(self.drain.warning.as_millis()).unwrap_or(u64::MAX),
        };
        let notified = connections.broadcast(&warning);
        info!(
            notified,
            warning_secs = self.drain.warning.as_secs(),
            "Maintenance notice sent"
        );

        // Clients that leave on their own during the warning shorten it
        let warning_deadline = (tokio::time::Instant::now() + self.drain.warning).min(deadline);
        self.wait_for_connections(warning_deadline).await;

        let closed = connections.disconnect_all();
        if closed > 0 {
            info!(closed, "Closing remaining connections");
        }
        let remaining = self.wait_for_connections(deadline).await;
        if remaining > 0 {
            warn!(remaining, "Drain deadline reached with connections still open");
        }

        // Connections that did not finish teardown in time still have their
        // presence removed before the worker reports closed
        for handle in connections.handles() {
            warn!(username = %handle.username, "Connection outlived the drain, removing presence");
            if let Err(e) = self.ctx.presence.unregister_if_owned(&handle.presence).await {
                error!(error = %e, username = %handle.username, "Failed to remove presence");
            }
            connections.unregister(&handle.username, &handle.connection_id);
        }

        self.ctx.lifecycle.mark_closed();
        info!(worker_id = %self.ctx.worker_id, "Worker drained");
    }

    /// Returns how many connections are still open at the deadline.
    async fn wait_for_connections(&self, deadline: tokio::time::Instant) -> usize {
        loop {
            let remaining = self.ctx.connections.connection_count();
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                return remaining;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}
