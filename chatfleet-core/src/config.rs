use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest frame limit that still leaves room for a short message.
const MIN_FRAME_BYTES: usize = 1024;

/// Application configuration shared by the worker and the autoscaler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
    pub worker: WorkerConfig,
    pub session: SessionConfig,
    pub presence: PresenceConfig,
    pub pending: PendingConfig,
    pub routing: RoutingConfig,
    pub drain: DrainConfig,
    pub autoscaler: AutoscalerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Client-facing TCP port (newline-delimited JSON frames)
    pub port: u16,
    /// Admin HTTP port (health, readiness, pre-stop hook)
    pub admin_port: u16,
    /// Maximum length of a single frame in bytes
    pub max_frame_bytes: usize,
    /// Capacity of each connection's outgoing queue
    pub outgoing_queue_capacity: usize,
    /// A client that accepts no data for this long is disconnected
    pub write_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            admin_port: 8080,
            max_frame_bytes: 64 * 1024,
            outgoing_queue_capacity: 256,
            write_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty URL selects the in-process store (single worker only)
    pub url: String,
    pub operation_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            operation_timeout_ms: 5000,
        }
    }
}

impl RedisConfig {
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Explicit worker id; falls back to `HOSTNAME`, then the machine hostname
    pub id: Option<String>,
}

impl WorkerConfig {
    /// Resolve the id this worker registers presence under.
    #[must_use]
    pub fn resolve_id(&self) -> String {
        if let Some(id) = self.id.as_ref().filter(|id| !id.is_empty()) {
            return id.clone();
        }
        if let Ok(pod) = std::env::var("HOSTNAME") {
            if !pod.is_empty() {
                return pod;
            }
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "worker".to_string());
        format!("{host}-{}", nanoid::nanoid!(6))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_seconds: 600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Safety-net expiry for entries of workers that crash without draining
    pub ttl_seconds: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { ttl_seconds: 1800 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingConfig {
    pub capacity: usize,
    pub ttl_seconds: u64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// How long a delivered message id is remembered per recipient
    pub dedup_window_seconds: u64,
    /// How often expired dedup entries are swept
    pub dedup_cleanup_seconds: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            dedup_window_seconds: 600,
            dedup_cleanup_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Time between the maintenance warning and force-closing connections
    pub warning_seconds: u64,
    /// Outer bound granted by the orchestrator before the process is killed
    pub grace_seconds: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            warning_seconds: 3,
            grace_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    pub namespace: String,
    pub deployment: String,
    pub users_per_replica: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub interval_seconds: u64,
    pub scale_down_delay_seconds: u64,
    /// Kubernetes API server; defaults to the in-cluster service address
    pub api_server: String,
    pub token_path: String,
    pub ca_cert_path: String,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            namespace: "chat-app".to_string(),
            deployment: "chat-server".to_string(),
            users_per_replica: 3,
            min_replicas: 1,
            max_replicas: 10,
            interval_seconds: 10,
            scale_down_delay_seconds: 60,
            api_server: "https://kubernetes.default.svc".to_string(),
            token_path: "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string(),
            ca_cert_path: "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt".to_string(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Priority:
    /// 1. Environment variables (`CHATFLEET_REDIS__URL`, ...)
    /// 2. Config file, when given and present
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CHATFLEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Check for values that would make the fleet misbehave. Returns every
    /// problem found rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.session.ttl_seconds == 0 {
            errors.push("session.ttl_seconds must be positive".to_string());
        }
        if self.presence.ttl_seconds == 0 {
            errors.push("presence.ttl_seconds must be positive".to_string());
        }
        if self.pending.capacity == 0 {
            errors.push("pending.capacity must be positive".to_string());
        }
        if self.server.outgoing_queue_capacity == 0 {
            errors.push("server.outgoing_queue_capacity must be positive".to_string());
        }
        if self.server.max_frame_bytes < MIN_FRAME_BYTES {
            errors.push(format!(
                "server.max_frame_bytes must be at least {MIN_FRAME_BYTES}"
            ));
        }
        if self.server.write_timeout_seconds == 0 {
            errors.push("server.write_timeout_seconds must be positive".to_string());
        }
        if self.drain.warning_seconds >= self.drain.grace_seconds {
            errors.push(format!(
                "drain.warning_seconds ({}) must be shorter than drain.grace_seconds ({})",
                self.drain.warning_seconds, self.drain.grace_seconds
            ));
        }
        let scaler = &self.autoscaler;
        if scaler.users_per_replica == 0 {
            errors.push("autoscaler.users_per_replica must be positive".to_string());
        }
        if scaler.min_replicas > scaler.max_replicas {
            errors.push(format!(
                "autoscaler.min_replicas ({}) exceeds max_replicas ({})",
                scaler.min_replicas, scaler.max_replicas
            ));
        }
        if scaler.interval_seconds == 0 {
            errors.push("autoscaler.interval_seconds must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    #[must_use]
    pub fn admin_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.admin_port)
    }
}
