use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::Response,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const HEARTBEAT_TOTAL: &str = "fettle_heartbeat_total";
pub const HEALTH_CHECKS_TOTAL: &str = "fettle_health_checks_total";
pub const PROCESS_EXITS_TOTAL: &str = "fettle_process_exits_total";
pub const HTTP_REQUESTS_TOTAL: &str = "fettle_http_requests_total";
pub const HTTP_REQUEST_SECONDS: &str = "fettle_http_request_duration_seconds";

/// Install the global Prometheus recorder. Can only succeed once per process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Mount `/metrics` on `router`, and count and time every request it serves.
pub fn setup_metrics_routes(router: Router, recorder_handle: PrometheusHandle) -> Router {
    let render = move || {
        let recorder_handle = recorder_handle.clone();
        async move { recorder_handle.render() }
    };

    router
        .route("/metrics", get(render))
        .layer(axum::middleware::from_fn(record_request))
}

// Requests that matched no route share the "unmatched" label.
async fn record_request(req: Request<Body>, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or("unmatched", MatchedPath::as_str)
        .to_owned();

    let start = Instant::now();
    let response = next.run(req).await;

    let labels = [
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS_TOTAL, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_SECONDS, &labels).record(start.elapsed().as_secs_f64());

    response
}
