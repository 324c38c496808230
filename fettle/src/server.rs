use std::io;

use axum::{
    extract::{RawQuery, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::heartbeat::HEALTH_PATH;
use crate::identity::Identity;
use crate::metrics::{setup_metrics_routes, HEALTH_CHECKS_TOTAL};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("http server failed: {0}")]
    Serve(#[source] io::Error),
    #[error("http server stopped")]
    Stopped,
    #[error("http server task died")]
    Died,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct HealthResponse {
    #[serde(rename = "Message")]
    pub message: String,
}

impl HealthResponse {
    fn ok() -> (StatusCode, Json<Self>) {
        (
            StatusCode::OK,
            Json(Self {
                message: "OK".to_owned(),
            }),
        )
    }

    fn mismatch() -> (StatusCode, Json<Self>) {
        (
            StatusCode::NOT_FOUND,
            Json(Self {
                message: "Mismatch".to_owned(),
            }),
        )
    }
}

/// Router answering health checks for `identity`. `/metrics` is only mounted when a
/// recorder handle is given.
pub fn router(identity: Identity, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route(HEALTH_PATH, get(health))
        .with_state(identity);

    match metrics {
        Some(recorder_handle) => setup_metrics_routes(router, recorder_handle),
        None => router,
    }
}

// A wrong token and an unparseable one get the same answer on purpose, callers only learn
// whether they hold this instance's identity.
async fn health(
    State(identity): State<Identity>,
    RawQuery(query): RawQuery,
) -> (StatusCode, Json<HealthResponse>) {
    debug!(query = query.as_deref().unwrap_or_default(), "health check request");

    let token = query.as_deref().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "id")
            .map(|(_, value)| value.into_owned())
    });

    let Some(token) = token else {
        debug!("health check without id, rejecting");
        metrics::counter!(HEALTH_CHECKS_TOTAL, "outcome" => "missing").increment(1);
        return HealthResponse::mismatch();
    };

    if identity.matches(&token) {
        metrics::counter!(HEALTH_CHECKS_TOTAL, "outcome" => "ok").increment(1);
        HealthResponse::ok()
    } else {
        debug!(token = %token, "health check id mismatch");
        metrics::counter!(HEALTH_CHECKS_TOTAL, "outcome" => "mismatch").increment(1);
        HealthResponse::mismatch()
    }
}

/// Serve `router` on an already bound listener until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on {}", addr);
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(ServerError::Serve)
}

pub async fn listen(
    bind: String,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|source| ServerError::Bind { addr: bind, source })?;

    serve(listener, router, shutdown).await
}

/// Run the health endpoint in the background. The returned channel yields once, with the
/// reason the listener is gone: a bind failure, a serve error, or [`ServerError::Stopped`].
pub fn start(
    bind: String,
    router: Router,
    shutdown: CancellationToken,
) -> oneshot::Receiver<ServerError> {
    let (exit_tx, exit_rx) = oneshot::channel();

    tokio::spawn(async move {
        let reason = match listen(bind, router, shutdown).await {
            Ok(()) => ServerError::Stopped,
            Err(e) => e,
        };
        // The coordinator may be gone already during shutdown.
        drop(exit_tx.send(reason));
    });

    exit_rx
}
