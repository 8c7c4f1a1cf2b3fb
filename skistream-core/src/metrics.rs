//! Prometheus metrics for the buffer and the streaming loops, served over HTTP.
//!
//! Every metric is a family labeled by `log`, so each of the three logs can be watched on its
//! own. Metrics are registered once into a process wide registry and the handles are reached
//! through [buffer_metrics] and [streamer_metrics].

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::buffer::LogType;
use crate::{Error, Result};

const REGISTRY_PREFIX: &str = "skistream";
const LOG_LABEL: &str = "log";

// buffer
const APPENDED: &str = "buffer_appended";
const STORE_RETRIES: &str = "buffer_store_retries";
const PRUNED: &str = "buffer_pruned";
const PENDING: &str = "buffer_pending";

// streamer
const READ: &str = "streamer_read";
const SENT: &str = "streamer_sent";
const SENT_BATCHES: &str = "streamer_sent_batches";
const SINK_RETRIES: &str = "streamer_sink_retries";
const REJECTED_BATCHES: &str = "streamer_rejected_batches";
const WATERMARK: &str = "streamer_watermark";

type Labels = Vec<(String, String)>;

/// The global register of all metrics.
struct GlobalRegistry {
    // metrics are registered once, a blocking mutex is fine
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_PREFIX)),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Metrics of the buffer store.
pub(crate) struct BufferMetrics {
    pub(crate) appended: Family<Labels, Counter>,
    pub(crate) store_retries: Family<Labels, Counter>,
    pub(crate) pruned: Family<Labels, Counter>,
    pub(crate) pending: Family<Labels, Gauge>,
}

impl BufferMetrics {
    fn new() -> Self {
        let metrics = Self {
            appended: Family::default(),
            store_retries: Family::default(),
            pruned: Family::default(),
            pending: Family::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            APPENDED,
            "Records durably appended to a log",
            metrics.appended.clone(),
        );
        registry.register(
            STORE_RETRIES,
            "Storage operations retried because the log was locked",
            metrics.store_retries.clone(),
        );
        registry.register(
            PRUNED,
            "Records deleted from a log after the ingestion service committed them",
            metrics.pruned.clone(),
        );
        registry.register(
            PENDING,
            "Records waiting in a log",
            metrics.pending.clone(),
        );
        metrics
    }
}

static BUFFER_METRICS: OnceLock<BufferMetrics> = OnceLock::new();

pub(crate) fn buffer_metrics() -> &'static BufferMetrics {
    BUFFER_METRICS.get_or_init(BufferMetrics::new)
}

/// Metrics of the streaming loops.
pub(crate) struct StreamerMetrics {
    pub(crate) read: Family<Labels, Counter>,
    pub(crate) sent: Family<Labels, Counter>,
    pub(crate) sent_batches: Family<Labels, Counter>,
    pub(crate) sink_retries: Family<Labels, Counter>,
    pub(crate) rejected_batches: Family<Labels, Counter>,
    pub(crate) watermark: Family<Labels, Gauge>,
}

impl StreamerMetrics {
    fn new() -> Self {
        let metrics = Self {
            read: Family::default(),
            sent: Family::default(),
            sent_batches: Family::default(),
            sink_retries: Family::default(),
            rejected_batches: Family::default(),
            watermark: Family::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            READ,
            "Records read from a log for delivery",
            metrics.read.clone(),
        );
        registry.register(
            SENT,
            "Records handed to the ingestion service, redeliveries included",
            metrics.sent.clone(),
        );
        registry.register(
            SENT_BATCHES,
            "Batches handed to the ingestion service",
            metrics.sent_batches.clone(),
        );
        registry.register(
            SINK_RETRIES,
            "Calls to the ingestion service retried after a transient failure",
            metrics.sink_retries.clone(),
        );
        registry.register(
            REJECTED_BATCHES,
            "Batches the ingestion service refused",
            metrics.rejected_batches.clone(),
        );
        registry.register(
            WATERMARK,
            "Highest sequence id the ingestion service has committed for a log",
            metrics.watermark.clone(),
        );
        metrics
    }
}

static STREAMER_METRICS: OnceLock<StreamerMetrics> = OnceLock::new();

pub(crate) fn streamer_metrics() -> &'static StreamerMetrics {
    STREAMER_METRICS.get_or_init(StreamerMetrics::new)
}

static LOG_LABELS: OnceLock<[Labels; 3]> = OnceLock::new();

/// Labels identifying a log, built once per log.
pub(crate) fn log_labels(log: LogType) -> &'static Labels {
    let [season_pass, resort_ticket, lift_ride] = LOG_LABELS.get_or_init(|| {
        LogType::ALL.map(|log| vec![(LOG_LABEL.to_string(), log.as_str().to_string())])
    });
    match log {
        LogType::SeasonPass => season_pass,
        LogType::ResortTicket => resort_ticket,
        LogType::LiftRide => lift_ride,
    }
}

/// Snapshot of every registered metric in the OpenMetrics text format.
pub async fn metrics_handler() -> impl IntoResponse {
    let state = global_registry().registry.lock();
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &state) {
        error!(?e, "Encoding metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response();
    }
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
}

/// Serves `/metrics` and `/livez` on `addr` until `cancel` fires.
pub async fn start_metrics_server(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    // register everything up front so a scrape before the first event sees every metric
    buffer_metrics();
    streamer_metrics();

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(%addr, "Metrics server listening");

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Metrics(format!("Serving metrics: {e}")))
}
