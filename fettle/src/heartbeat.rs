use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::{Host, Url};

use crate::config::Config;
use crate::identity::Identity;
use crate::metrics::HEARTBEAT_TOTAL;
use crate::registry::{HealthCheck, Registration, Registry, RegistryError};

pub const HEALTH_PATH: &str = "/health";

#[derive(Error, Debug)]
pub enum HeartbeatError {
    #[error("cannot build a health check url from {0}")]
    InvalidCheckBase(Url),
    #[error("service address {0} has no host")]
    MissingHost(Url),
    #[error("service address {0} has no port")]
    MissingPort(Url),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What gets announced on every heartbeat, besides the identity.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub name: String,
    pub address: Url,
    pub check_base: Url,
    pub tags: Vec<String>,
    pub check_interval: String,
    pub deregister_after: String,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.service_name.as_str().to_owned(),
            address: config.service_address.clone(),
            check_base: config.health_check_base().clone(),
            tags: config.service_tags.0.clone(),
            check_interval: config.check_interval.as_str().to_owned(),
            deregister_after: config.deregister_after.as_str().to_owned(),
        }
    }
}

/// `{base}/health?id={identity}`, keeping any path prefix of `base`.
pub fn check_url(base: &Url, identity: &Identity) -> Result<Url, HeartbeatError> {
    if base.cannot_be_a_base() {
        return Err(HeartbeatError::InvalidCheckBase(base.clone()));
    }

    let mut url = base.clone();
    let path = format!("{}{}", base.path().trim_end_matches('/'), HEALTH_PATH);
    url.set_path(&path);
    url.set_fragment(None);
    url.query_pairs_mut()
        .clear()
        .append_pair("id", &identity.to_string());

    Ok(url)
}

/// Build the registration for this instance. Rebuilt on every beat, never cached.
pub fn registration(
    settings: &ServiceSettings,
    identity: &Identity,
) -> Result<Registration, HeartbeatError> {
    let address = match settings.address.host() {
        Some(Host::Ipv6(addr)) => addr.to_string(),
        Some(host) => host.to_string(),
        None => return Err(HeartbeatError::MissingHost(settings.address.clone())),
    };
    let port = settings
        .address
        .port_or_known_default()
        .ok_or_else(|| HeartbeatError::MissingPort(settings.address.clone()))?;

    Ok(Registration {
        id: format!("{}-{}", settings.name, identity),
        name: settings.name.clone(),
        address,
        port,
        tags: settings.tags.clone(),
        check: HealthCheck {
            http: check_url(&settings.check_base, identity)?.to_string(),
            interval: settings.check_interval.clone(),
            deregister_critical_service_after: settings.deregister_after.clone(),
        },
    })
}

/// Periodically (re-)registers the instance. Registry failures are logged and retried after
/// the next interval, they never stop the loop.
pub struct Heartbeat {
    registry: Arc<dyn Registry>,
    settings: ServiceSettings,
    identity: Identity,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(
        registry: Arc<dyn Registry>,
        settings: ServiceSettings,
        identity: Identity,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            settings,
            identity,
            interval,
        }
    }

    pub async fn beat(&self) -> Result<(), HeartbeatError> {
        let registration = registration(&self.settings, &self.identity)?;
        debug!(service_id = %registration.id, check = %registration.check.http, "registering");

        self.registry.register(&registration).await?;
        Ok(())
    }

    /// Beat immediately, then again one interval after each attempt finishes, until
    /// `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.beat() => result,
            };

            match result {
                Ok(()) => {
                    metrics::counter!(HEARTBEAT_TOTAL, "outcome" => "success").increment(1);
                    debug!(service = %self.settings.name, "registered with registry");
                }
                Err(e) => {
                    metrics::counter!(HEARTBEAT_TOTAL, "outcome" => "failure").increment(1);
                    warn!(service = %self.settings.name, "failed to register, will retry: {}", e);
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("heartbeat stopped");
    }
}
