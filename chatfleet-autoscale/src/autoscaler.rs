//! Periodic control loop sizing the worker fleet to the online population.

use std::sync::Arc;
use std::time::Duration;

use chatfleet_core::service::PresenceRegistry;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;
use crate::policy::{ScaleDecision, ScalePolicy};

/// Result of one control tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Online count could not be read; nothing was done
    Skipped,
    /// The orchestrator call failed; retried next tick
    Failed(ScaleDecision),
    Steady(ScaleDecision),
    ScaledUp(ScaleDecision),
    /// Oversized, but not for long enough yet
    Holding(ScaleDecision),
    ScaledDown(ScaleDecision),
}

pub struct Autoscaler {
    presence: PresenceRegistry,
    orchestrator: Arc<dyn Orchestrator>,
    policy: ScalePolicy,
    /// When `desired < current` was first seen in the current streak
    lower_since: Option<Instant>,
}

impl Autoscaler {
    #[must_use]
    pub fn new(
        presence: PresenceRegistry,
        orchestrator: Arc<dyn Orchestrator>,
        policy: ScalePolicy,
    ) -> Self {
        Self {
            presence,
            orchestrator,
            policy,
            lower_since: None,
        }
    }

    /// Tick every `interval` until `cancel` fires. Ticks run one at a time;
    /// a slow tick delays the next one instead of overlapping it.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        info!(
            interval_secs = interval.as_secs(),
            users_per_replica = self.policy.users_per_replica,
            min_replicas = self.policy.min_replicas,
            max_replicas = self.policy.max_replicas,
            "Autoscaler started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Autoscaler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    pub async fn tick(&mut self) -> TickOutcome {
        let online = match self.presence.count().await {
            Ok(online) => online,
            Err(e) => {
                warn!(error = %e, "Failed to read online count, skipping tick");
                return TickOutcome::Skipped;
            }
        };
        let desired = self.policy.desired_replicas(online);

        let current = match self.orchestrator.current_replicas().await {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "Failed to read replica count");
                return TickOutcome::Failed(ScaleDecision {
                    observed_online_count: online,
                    desired_replicas: desired,
                    current_replicas: 0,
                });
            }
        };

        let decision = ScaleDecision {
            observed_online_count: online,
            desired_replicas: desired,
            current_replicas: current,
        };
        debug!(?decision, "Autoscaler tick");

        if desired > current {
            self.lower_since = None;
            return match self.orchestrator.set_replicas(desired).await {
                Ok(()) => {
                    info!(online, from = current, to = desired, "Scaled up");
                    TickOutcome::ScaledUp(decision)
                }
                Err(e) => {
                    warn!(error = %e, to = desired, "Scale up failed");
                    TickOutcome::Failed(decision)
                }
            };
        }

        if desired == current {
            self.lower_since = None;
            return TickOutcome::Steady(decision);
        }

        let now = Instant::now();
        let since = *self.lower_since.get_or_insert(now);
        if now.duration_since(since) < self.policy.scale_down_delay {
            debug!(
                held_secs = now.duration_since(since).as_secs(),
                "Waiting before scaling down"
            );
            return TickOutcome::Holding(decision);
        }

        match self.orchestrator.set_replicas(desired).await {
            Ok(()) => {
                info!(online, from = current, to = desired, "Scaled down");
                self.lower_since = None;
                TickOutcome::ScaledDown(decision)
            }
            // The streak is kept so the next tick retries right away
            Err(e) => {
                warn!(error = %e, to = desired, "Scale down failed");
                TickOutcome::Failed(decision)
            }
        }
    }
}
