//! Register a workload with the service registry, answer its health checks, and supervise
//! its processes.
use std::process::ExitCode;
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::WrapErr;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use fettle::config::Config;
use fettle::coordinator::{self, Instance};
use fettle::drain::LogSink;
use fettle::error::{exit_code, StartupError};
use fettle::metrics::setup_metrics_recorder;
use fettle::registry::ConsulRegistry;

async fn shutdown_signal() -> std::io::Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    };

    Ok(())
}

fn setup_tracing(debug: bool) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base_layer = fmt::layer().with_target(true).with_level(true);

    // Pretty output for local runs, JSON for log shipping.
    let log_layer = if debug {
        base_layer.with_ansi(true).with_filter(filter()).boxed()
    } else {
        base_layer.json().with_filter(filter()).boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

async fn start(config: &Config, shutdown: CancellationToken) -> Result<Instance, StartupError> {
    let metrics = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };

    let registry = ConsulRegistry::new(&config.registry_address, config.registry_timeout())?;

    coordinator::start(
        config,
        Arc::new(registry),
        Arc::new(LogSink),
        metrics,
        shutdown,
    )
    .await
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::init_from_env().wrap_err("failed to load configuration from env");
    setup_tracing(config.as_ref().is_ok_and(|config| config.debug));

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(exit_code::CONFIG);
        }
    };

    let shutdown = CancellationToken::new();
    let signalled = shutdown.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => signalled.cancel(),
            Err(e) => error!("failed to register signal handlers: {}", e),
        }
    });

    let instance = match start(&config, shutdown).await {
        Ok(instance) => instance,
        Err(e) => {
            error!("failed to start: {}", e);
            return ExitCode::from(exit_code::STARTUP);
        }
    };

    let termination = instance.run().await;
    ExitCode::from(termination.exit_code())
}
