//! Replica count control over the orchestrator API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chatfleet_core::config::AutoscalerConfig;
use chatfleet_core::{Error, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Certificate, Client};
use serde::Deserialize;
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Orchestrator: Send + Sync + 'static {
    async fn current_replicas(&self) -> Result<u32>;

    async fn set_replicas(&self, replicas: u32) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct Scale {
    spec: ScaleSpec,
}

#[derive(Debug, Deserialize)]
struct ScaleSpec {
    #[serde(default)]
    replicas: u32,
}

/// Drives the `scale` subresource of an `apps/v1` Deployment with the pod's
/// service account.
pub struct KubernetesOrchestrator {
    http: Client,
    scale_url: String,
    token_path: PathBuf,
    deployment: String,
}

impl KubernetesOrchestrator {
    /// Build the client. The CA bundle is optional so the API server can be
    /// reached over plain HTTP in development.
    pub async fn from_config(config: &AutoscalerConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);

        let ca_path = Path::new(&config.ca_cert_path);
        if tokio::fs::try_exists(ca_path).await.unwrap_or(false) {
            let pem = tokio::fs::read(ca_path).await?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                Error::Configuration(format!("Invalid CA certificate {}: {e}", ca_path.display()))
            })?;
            builder = builder.add_root_certificate(cert);
        } else {
            debug!(path = %ca_path.display(), "No cluster CA bundle, using system roots");
        }

        let http = builder
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))?;

        let scale_url = format!(
            "{}/apis/apps/v1/namespaces/{}/deployments/{}/scale",
            config.api_server.trim_end_matches('/'),
            config.namespace,
            config.deployment
        );
        info!(url = %scale_url, "Kubernetes orchestrator configured");

        Ok(Self {
            http,
            scale_url,
            token_path: PathBuf::from(&config.token_path),
            deployment: config.deployment.clone(),
        })
    }

    /// Service account tokens rotate, so it is read for every request.
    async fn token(&self) -> Result<String> {
        let token = tokio::fs::read_to_string(&self.token_path)
            .await
            .map_err(|e| {
                Error::Orchestrator(format!(
                    "Failed to read service account token {}: {e}",
                    self.token_path.display()
                ))
            })?;
        Ok(token.trim().to_string())
    }
}

#[async_trait]
impl Orchestrator for KubernetesOrchestrator {
    async fn current_replicas(&self) -> Result<u32> {
        let scale: Scale = self
            .http
            .get(&self.scale_url)
            .bearer_auth(self.token().await?)
            .send()
            .await
            .map_err(|e| Error::Orchestrator(format!("Failed to read scale: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Orchestrator(format!("Kubernetes API error: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Orchestrator(format!("Failed to parse scale: {e}")))?;

        Ok(scale.spec.replicas)
    }

    async fn set_replicas(&self, replicas: u32) -> Result<()> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });

        self.http
            .patch(&self.scale_url)
            .bearer_auth(self.token().await?)
            .header(CONTENT_TYPE, "application/merge-patch+json")
            .body(serde_json::to_vec(&patch)?)
            .send()
            .await
            .map_err(|e| Error::Orchestrator(format!("Failed to patch scale: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Orchestrator(format!("Kubernetes API error: {e}")))?;

        info!(deployment = %self.deployment, replicas, "Replica count updated");
        Ok(())
    }
}
