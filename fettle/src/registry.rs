use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use url::Url;

const REGISTER_PATH: &str = "v1/agent/service/register";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid registry url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to reach registry: {0}")]
    Request(#[from] reqwest::Error),
    #[error("registry rejected registration with {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

/// Health check the registry runs against the service.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    #[serde(rename = "HTTP")]
    pub http: String,
    #[serde(rename = "Interval")]
    pub interval: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    pub deregister_critical_service_after: String,
}

/// A service announcement. Registering the same `id` twice replaces the first entry.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "Check")]
    pub check: HealthCheck,
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, registration: &Registration) -> Result<(), RegistryError>;
}

/// Registers services with a Consul-compatible agent over its HTTP API.
pub struct ConsulRegistry {
    client: reqwest::Client,
    register_url: Url,
}

impl ConsulRegistry {
    pub fn new(address: &Url, timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        // Url::join drops the last path segment unless the base ends with a slash.
        let mut base = address.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let register_url = base.join(REGISTER_PATH)?;

        Ok(Self {
            client,
            register_url,
        })
    }

    pub fn register_url(&self) -> &Url {
        &self.register_url
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn register(&self, registration: &Registration) -> Result<(), RegistryError> {
        let response = self
            .client
            .put(self.register_url.clone())
            .json(registration)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(RegistryError::Rejected { status, body })
    }
}
