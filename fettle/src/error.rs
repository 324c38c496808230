use metrics_exporter_prometheus::BuildError;
use thiserror::Error;

use crate::heartbeat::HeartbeatError;
use crate::registry::RegistryError;
use crate::supervisor::SupervisorError;

/// Enumeration of errors that abort startup before the instance is running.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("invalid registration settings: {0}")]
    Registration(#[from] HeartbeatError),
    #[error("failed to create registry client: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Launch(#[from] SupervisorError),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] BuildError),
}

/// Process exit codes, one per terminal cause.
pub mod exit_code {
    /// Stopped by SIGINT or SIGTERM.
    pub const SHUTDOWN: u8 = 0;
    pub const CONFIG: u8 = 2;
    pub const STARTUP: u8 = 3;
    /// A supervised process exited with status 0.
    pub const PROCESS_EXITED: u8 = 4;
    pub const PROCESS_FAILED: u8 = 5;
    pub const SERVER_EXITED: u8 = 6;
}
