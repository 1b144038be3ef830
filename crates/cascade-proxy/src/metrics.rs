//! Prometheus metrics for cascade-proxy.
//!
//! Tracks probe outcomes, mode switches, dials and forwarded requests.

use crate::mode::Mode;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_int_gauge_vec, CounterVec, Encoder, IntGaugeVec, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

lazy_static! {
    /// Reachability probe results
    pub static ref PROBES_TOTAL: CounterVec = register_counter_vec!(
        "cascade_probes_total",
        "Total number of reachability probes by result",
        &["result"]  // result: success|failure
    )
    .unwrap();

    /// Server replacements triggered by a mode change
    pub static ref MODE_SWITCHES_TOTAL: CounterVec = register_counter_vec!(
        "cascade_mode_switches_total",
        "Total number of mode switches by target mode",
        &["mode"]
    )
    .unwrap();

    /// 1 for the mode currently served, 0 otherwise
    pub static ref ACTIVE_MODE: IntGaugeVec = register_int_gauge_vec!(
        "cascade_active_mode",
        "Mode of the running proxy server",
        &["mode"]
    )
    .unwrap();

    /// Outbound dials for CONNECT tunnels
    pub static ref DIALS_TOTAL: CounterVec = register_counter_vec!(
        "cascade_dials_total",
        "Total number of tunnel dials by route and result",
        &["route", "result"]  // route: direct|upstream
    )
    .unwrap();

    /// Plain HTTP requests forwarded
    pub static ref FORWARDED_TOTAL: CounterVec = register_counter_vec!(
        "cascade_forwarded_requests_total",
        "Total number of forwarded HTTP requests by route and status",
        &["route", "status"]
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_probe(success: bool) {
    let result = if success { "success" } else { "failure" };
    PROBES_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_mode_switch(mode: Mode) {
    MODE_SWITCHES_TOTAL
        .with_label_values(&[mode.as_str()])
        .inc();
    set_active_mode(Some(mode));
}

/// `None` when no server is running.
pub fn set_active_mode(mode: Option<Mode>) {
    for candidate in [Mode::Direct, Mode::Cascade] {
        let value = i64::from(mode == Some(candidate));
        ACTIVE_MODE
            .with_label_values(&[candidate.as_str()])
            .set(value);
    }
}

pub fn record_dial(route: &str, success: bool) {
    let result = if success { "success" } else { "error" };
    DIALS_TOTAL.with_label_values(&[route, result]).inc();
}

pub fn record_forward(route: &str, status: StatusCode) {
    FORWARDED_TOTAL
        .with_label_values(&[route, status.as_str()])
        .inc();
}

/// Serve `/metrics` until `shutdown` fires.
pub async fn serve_metrics(
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.cancelled() => break,
        };
        tokio::spawn(async move {
            let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                let response = if req.uri().path() == "/metrics" {
                    Response::builder()
                        .header("content-type", "text/plain; version=0.0.4")
                        .body(Full::new(Bytes::from(collect_metrics())))
                } else {
                    Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .body(Full::new(Bytes::new()))
                };
                Ok::<_, Infallible>(response.unwrap_or_default())
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Metrics connection error: {}", e);
            }
        });
    }
    Ok(())
}
