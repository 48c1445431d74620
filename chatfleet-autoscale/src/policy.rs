use std::time::Duration;

use chatfleet_core::config::AutoscalerConfig;
use serde::Serialize;

/// How many replicas a given number of online users needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePolicy {
    pub users_per_replica: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// How long the fleet must stay oversized before it shrinks
    pub scale_down_delay: Duration,
}

impl ScalePolicy {
    #[must_use]
    pub fn from_config(config: &AutoscalerConfig) -> Self {
        Self {
            users_per_replica: config.users_per_replica.max(1),
            min_replicas: config.min_replicas,
            max_replicas: config.max_replicas.max(config.min_replicas),
            scale_down_delay: Duration::from_secs(config.scale_down_delay_seconds),
        }
    }

    /// `ceil(online / users_per_replica)` clamped to the replica bounds.
    /// A minimum above the maximum wins.
    #[must_use]
    pub fn desired_replicas(&self, online: usize) -> u32 {
        let per = u64::from(self.users_per_replica.max(1));
        let online = u64::try_from(online).unwrap_or(u64::MAX);
        let needed = u32::try_from(online.div_ceil(per)).unwrap_or(u32::MAX);
        needed.min(self.max_replicas).max(self.min_replicas)
    }
}

/// What one tick observed and wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScaleDecision {
    pub observed_online_count: usize,
    pub desired_replicas: u32,
    pub current_replicas: u32,
}
