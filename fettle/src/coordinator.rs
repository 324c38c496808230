//! Starts every activity of an instance and decides, from the first terminal event, why the
//! sidecar stops.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::drain::LineSink;
use crate::error::{exit_code, StartupError};
use crate::heartbeat::{registration, Heartbeat, ServiceSettings};
use crate::identity::Identity;
use crate::registry::Registry;
use crate::server::{self, ServerError};
use crate::supervisor::{Launched, SupervisedProcess, Supervisor};

/// The event that ended an instance.
#[derive(Debug)]
pub enum Termination {
    /// A supervised process exited, cleanly or not.
    ProcessExited(SupervisedProcess),
    /// The health endpoint failed to bind or stopped serving.
    ServerExited(ServerError),
    /// The shutdown token was cancelled from outside, e.g. on a signal.
    Shutdown,
}

impl Termination {
    pub fn exit_code(&self) -> u8 {
        match self {
            Termination::ProcessExited(process) if process.succeeded() => {
                exit_code::PROCESS_EXITED
            }
            Termination::ProcessExited(_) => exit_code::PROCESS_FAILED,
            Termination::ServerExited(_) => exit_code::SERVER_EXITED,
            Termination::Shutdown => exit_code::SHUTDOWN,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::ProcessExited(SupervisedProcess {
                name,
                command,
                error: None,
            }) => write!(f, "process {name} ({command}) exited cleanly"),
            Termination::ProcessExited(SupervisedProcess {
                name,
                command,
                error: Some(e),
            }) => write!(f, "process {name} ({command}) failed: {e}"),
            Termination::ServerExited(e) => write!(f, "health endpoint exited: {e}"),
            Termination::Shutdown => f.write_str("shutdown requested"),
        }
    }
}

/// A running sidecar: identity, supervised processes, heartbeat and health endpoint.
pub struct Instance {
    identity: Identity,
    exit_on_success: bool,
    grace: Duration,
    shutdown: CancellationToken,
    supervisor: Supervisor,
    completions: mpsc::Receiver<SupervisedProcess>,
    server_exit: oneshot::Receiver<ServerError>,
}

/// Mint an identity, launch the configured processes, then start the heartbeat and the
/// health endpoint.
///
/// Nothing is left running when this returns an error: processes launched before a failing
/// one are stopped first.
pub async fn start(
    config: &Config,
    registry: Arc<dyn Registry>,
    sink: Arc<dyn LineSink>,
    metrics: Option<PrometheusHandle>,
    shutdown: CancellationToken,
) -> Result<Instance, StartupError> {
    let identity = Identity::new();
    info!(%identity, service = config.service_name.as_str(), "starting instance");

    // Catch bad addresses now instead of on every heartbeat.
    let settings = ServiceSettings::from_config(config);
    let initial = registration(&settings, &identity)?;
    info!(check = %initial.check.http, "health check url");

    let (mut supervisor, completions) =
        Supervisor::new(sink, shutdown.clone(), config.supervise.0.len());

    for spec in &config.supervise.0 {
        if let Err(e) = supervisor.launch(&spec.name, &spec.command).await {
            shutdown.cancel();
            supervisor.join(config.shutdown_grace()).await;
            return Err(e.into());
        }
    }

    let heartbeat = Heartbeat::new(registry, settings, identity, config.heartbeat_interval());
    tokio::spawn(heartbeat.run(shutdown.clone()));

    let server_exit = server::start(
        config.bind(),
        server::router(identity, metrics),
        shutdown.clone(),
    );

    Ok(Instance {
        identity,
        exit_on_success: config.exit_on_success,
        grace: config.shutdown_grace(),
        shutdown,
        supervisor,
        completions,
        server_exit,
    })
}

impl Instance {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn launched(&self) -> &[Launched] {
        self.supervisor.launched()
    }

    /// Wait for the first terminal event, then stop everything that is still running.
    pub async fn run(mut self) -> Termination {
        let termination = self.wait().await;

        match &termination {
            Termination::Shutdown => info!("shutting down: {}", termination),
            _ => error!(exit_code = termination.exit_code(), "terminating: {}", termination),
        }

        self.shutdown.cancel();
        if !self.supervisor.join(self.grace).await {
            warn!("some supervised processes may still be running");
        }

        termination
    }

    // No priority between sources: whichever reports first decides the cause.
    async fn wait(&mut self) -> Termination {
        loop {
            tokio::select! {
                Some(process) = self.completions.recv() => {
                    if process.succeeded() && !self.exit_on_success {
                        info!(process = %process.name, "process exited cleanly, still running");
                        continue;
                    }
                    return Termination::ProcessExited(process);
                }
                exit = &mut self.server_exit => {
                    return Termination::ServerExited(exit.unwrap_or(ServerError::Died));
                }
                _ = self.shutdown.cancelled() => return Termination::Shutdown,
            }
        }
    }
}
