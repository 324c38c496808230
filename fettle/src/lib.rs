pub mod config;
pub mod coordinator;
pub mod drain;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod supervisor;
