#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::StatusCode;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fettle::config::{Config, NonZeroSecs, SupervisedCommands, Tags, TimeoutMs};
use fettle::coordinator::{self, Termination};
use fettle::drain::{LineSink, Stream};
use fettle::identity::Identity;
use fettle::registry::{Registration, Registry, RegistryError};

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(|| Config {
    host: "127.0.0.1".to_string(),
    port: 0,
    registry_address: "http://127.0.0.1:8500".parse().unwrap(),
    registry_timeout_ms: TimeoutMs(Duration::from_secs(1)),
    service_name: "api".parse().unwrap(),
    service_address: "http://127.0.0.1:8080".parse().unwrap(),
    health_check_address: None,
    service_tags: Tags(vec!["test".to_string()]),
    heartbeat_interval_secs: NonZeroSecs(1),
    check_interval: "10s".parse().unwrap(),
    deregister_after: "1m".parse().unwrap(),
    supervise: SupervisedCommands::default(),
    exit_on_success: true,
    shutdown_grace_secs: 5,
    export_prometheus: false,
    debug: false,
});

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Registry that records registrations, failing the first `failures` attempts.
#[derive(Default)]
pub struct TestRegistry {
    failures: usize,
    attempts: AtomicUsize,
    pub registrations: Mutex<Vec<Registration>>,
}

impl TestRegistry {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Registry for TestRegistry {
    async fn register(&self, registration: &Registration) -> Result<(), RegistryError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(RegistryError::Rejected {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "no cluster leader".to_string(),
            });
        }
        self.registrations.lock().unwrap().push(registration.clone());
        Ok(())
    }
}

/// Keeps all child output, in arrival order.
#[derive(Default)]
pub struct CapturedOutput {
    lines: Mutex<Vec<(String, Stream, String)>>,
}

impl CapturedOutput {
    pub fn lines(&self, process: &str, stream: Stream) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, s, _)| p == process && *s == stream)
            .map(|(_, _, line)| line.clone())
            .collect()
    }
}

impl LineSink for CapturedOutput {
    fn line(&self, process: &str, stream: Stream, line: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((process.to_string(), stream, line.to_string()));
    }
}

pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

pub struct InstanceHandle {
    pub addr: SocketAddr,
    pub identity: Identity,
    pub registry: Arc<TestRegistry>,
    pub output: Arc<CapturedOutput>,
    shutdown: CancellationToken,
    running: JoinHandle<Termination>,
}

impl InstanceHandle {
    pub async fn for_config(config: Config) -> Self {
        Self::with_registry(config, TestRegistry::default()).await
    }

    /// Start a full instance on a free port. Does not wait for the listener.
    pub async fn with_registry(mut config: Config, registry: TestRegistry) -> Self {
        config.port = free_port();
        let addr: SocketAddr = config.bind().parse().unwrap();
        if config.health_check_address.is_none() {
            config.health_check_address = Some(format!("http://{addr}").parse().unwrap());
        }

        let registry = Arc::new(registry);
        let output = Arc::new(CapturedOutput::default());
        let shutdown = CancellationToken::new();

        let instance = coordinator::start(
            &config,
            registry.clone(),
            output.clone(),
            None,
            shutdown.clone(),
        )
        .await
        .expect("failed to start instance");
        let identity = *instance.identity();

        let running = tokio::spawn(instance.run());

        InstanceHandle {
            addr,
            identity,
            registry,
            output,
            shutdown,
            running,
        }
    }

    /// Poll the health endpoint until it answers.
    pub async fn ready(&self) {
        for _ in 0..250 {
            if reqwest::get(format!("http://{}/health", self.addr)).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("health endpoint never came up on {}", self.addr);
    }

    pub async fn get(&self, path_and_query: &str) -> reqwest::Response {
        reqwest::get(format!("http://{}{}", self.addr, path_and_query))
            .await
            .expect("failed to send request")
    }

    /// Wait for the instance to stop on its own.
    pub async fn termination(self) -> Termination {
        tokio::time::timeout(Duration::from_secs(10), self.running)
            .await
            .expect("instance did not terminate")
            .unwrap()
    }

    pub async fn stop(self) -> Termination {
        self.shutdown.cancel();
        self.termination().await
    }
}
