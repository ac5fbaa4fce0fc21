use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::core::Collector;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for node health and observability.
///
/// All metrics use the "apmflow" namespace. Organized by stage:
/// - Workers: mailbox and message accounting per role
/// - Aggregation: flush cadence and output
/// - Remote: cluster traffic in both directions
/// - Persistence: storage writes and health per model
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Workers ===
    /// Messages accepted into a mailbox, by role.
    pub messages_received: CounterVec,
    /// Messages dropped, by role and reason.
    pub messages_dropped: CounterVec,
    /// Messages currently queued, by role.
    pub queue_depth: GaugeVec,
    /// Total mailbox capacity, by role.
    pub queue_capacity: GaugeVec,
    /// Messages refused by a full mailbox, by role.
    pub queue_rejected: CounterVec,
    /// Messages evicted by drop-oldest mailboxes, by role.
    pub queue_evicted: CounterVec,

    // === Aggregation ===
    /// Reduction map flushes, by role.
    pub aggregation_flushes: CounterVec,
    /// Reduced records emitted downstream, by role.
    pub aggregation_records_emitted: CounterVec,

    // === Remote ===
    /// Number of members in the cluster view, self included.
    pub cluster_size: Gauge,
    /// Batches delivered, by member.
    pub remote_out_batches: CounterVec,
    /// Records delivered, by member.
    pub remote_out_records: CounterVec,
    /// Failed send attempts, by member.
    pub remote_out_errors: CounterVec,
    /// Batches dropped after exhausting retries, by member.
    pub remote_batches_dropped: CounterVec,
    /// Envelopes waiting for delivery, by member.
    pub remote_queue_depth: GaugeVec,
    /// Inbound batches decoded.
    pub remote_in_batches: Counter,
    /// Inbound records started on their graph.
    pub remote_in_records: Counter,
    /// Inbound records naming an unknown graph.
    pub remote_in_unknown_graph: Counter,
    /// Inbound bodies that failed to decode.
    pub remote_in_malformed: Counter,

    // === Persistence ===
    /// Flush duration, by model.
    pub persistence_flush_duration: HistogramVec,
    /// Records written, by model.
    pub persistence_records_written: CounterVec,
    /// Failed flushes, by model.
    pub persistence_errors: CounterVec,
    /// Pending records evicted over the limit, by model.
    pub persistence_evicted: CounterVec,
    /// Records held back because they conflict with the stored record, by model.
    pub persistence_conflicts: CounterVec,
    /// Records waiting for the next flush, by model and instance.
    pub persistence_pending: GaugeVec,
    /// Whether the last write of a model instance succeeded (1=yes, 0=no).
    pub storage_healthy: GaugeVec,

    // === Node ===
    /// Node startup duration by phase.
    pub node_start_duration: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Workers ===
        let messages_received = CounterVec::new(
            Opts::new(
                "messages_received_total",
                "Messages accepted into a worker mailbox by role.",
            )
            .namespace("apmflow"),
            &["role"],
        )?;
        let messages_dropped = CounterVec::new(
            Opts::new(
                "messages_dropped_total",
                "Messages dropped by role and reason.",
            )
            .namespace("apmflow"),
            &["role", "reason"],
        )?;
        let queue_depth = GaugeVec::new(
            Opts::new("queue_depth", "Messages currently queued by role.").namespace("apmflow"),
            &["role"],
        )?;
        let queue_capacity = GaugeVec::new(
            Opts::new("queue_capacity", "Total mailbox capacity by role.").namespace("apmflow"),
            &["role"],
        )?;
        let queue_rejected = CounterVec::new(
            Opts::new(
                "queue_rejected_total",
                "Messages refused by a full mailbox by role.",
            )
            .namespace("apmflow"),
            &["role"],
        )?;
        let queue_evicted = CounterVec::new(
            Opts::new(
                "queue_evicted_total",
                "Messages evicted by drop-oldest mailboxes by role.",
            )
            .namespace("apmflow"),
            &["role"],
        )?;

        // === Aggregation ===
        let aggregation_flushes = CounterVec::new(
            Opts::new(
                "aggregation_flushes_total",
                "Reduction map flushes by role.",
            )
            .namespace("apmflow"),
            &["role"],
        )?;
        let aggregation_records_emitted = CounterVec::new(
            Opts::new(
                "aggregation_records_emitted_total",
                "Reduced records emitted downstream by role.",
            )
            .namespace("apmflow"),
            &["role"],
        )?;

        // === Remote ===
        let cluster_size = Gauge::with_opts(
            Opts::new("cluster_size", "Members in the cluster view, self included.")
                .namespace("apmflow"),
        )?;
        let remote_out_batches = CounterVec::new(
            Opts::new(
                "remote_out_batches_total",
                "Batches delivered to a member.",
            )
            .namespace("apmflow"),
            &["member"],
        )?;
        let remote_out_records = CounterVec::new(
            Opts::new(
                "remote_out_records_total",
                "Records delivered to a member.",
            )
            .namespace("apmflow"),
            &["member"],
        )?;
        let remote_out_errors = CounterVec::new(
            Opts::new(
                "remote_out_errors_total",
                "Failed send attempts by member.",
            )
            .namespace("apmflow"),
            &["member"],
        )?;
        let remote_batches_dropped = CounterVec::new(
            Opts::new(
                "remote_batches_dropped_total",
                "Batches dropped after exhausting retries by member.",
            )
            .namespace("apmflow"),
            &["member"],
        )?;
        let remote_queue_depth = GaugeVec::new(
            Opts::new(
                "remote_queue_depth",
                "Envelopes waiting for delivery by member.",
            )
            .namespace("apmflow"),
            &["member"],
        )?;
        let remote_in_batches = Counter::with_opts(
            Opts::new("remote_in_batches_total", "Inbound batches decoded.")
                .namespace("apmflow"),
        )?;
        let remote_in_records = Counter::with_opts(
            Opts::new(
                "remote_in_records_total",
                "Inbound records started on their graph.",
            )
            .namespace("apmflow"),
        )?;
        let remote_in_unknown_graph = Counter::with_opts(
            Opts::new(
                "remote_in_unknown_graph_total",
                "Inbound records naming an unknown graph.",
            )
            .namespace("apmflow"),
        )?;
        let remote_in_malformed = Counter::with_opts(
            Opts::new(
                "remote_in_malformed_total",
                "Inbound bodies that failed to decode.",
            )
            .namespace("apmflow"),
        )?;

        // === Persistence ===
        let persistence_flush_duration = HistogramVec::new(
            HistogramOpts::new(
                "persistence_flush_duration_seconds",
                "Persistence flush duration by model.",
            )
            .namespace("apmflow")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["model"],
        )?;
        let persistence_records_written = CounterVec::new(
            Opts::new(
                "persistence_records_written_total",
                "Records written to storage by model.",
            )
            .namespace("apmflow"),
            &["model"],
        )?;
        let persistence_errors = CounterVec::new(
            Opts::new(
                "persistence_errors_total",
                "Failed persistence flushes by model.",
            )
            .namespace("apmflow"),
            &["model"],
        )?;
        let persistence_evicted = CounterVec::new(
            Opts::new(
                "persistence_evicted_total",
                "Pending records evicted over the limit by model.",
            )
            .namespace("apmflow"),
            &["model"],
        )?;
        let persistence_conflicts = CounterVec::new(
            Opts::new(
                "persistence_conflicts_total",
                "Records held back because they conflict with the stored record by model.",
            )
            .namespace("apmflow"),
            &["model"],
        )?;
        let persistence_pending = GaugeVec::new(
            Opts::new(
                "persistence_pending_records",
                "Records waiting for the next flush by model and instance.",
            )
            .namespace("apmflow"),
            &["model", "instance"],
        )?;
        let storage_healthy = GaugeVec::new(
            Opts::new(
                "storage_healthy",
                "Whether the last write of a model instance succeeded (1=yes, 0=no).",
            )
            .namespace("apmflow"),
            &["model", "instance"],
        )?;

        // === Node ===
        let node_start_duration = GaugeVec::new(
            Opts::new(
                "node_start_duration_seconds",
                "Node startup duration by phase.",
            )
            .namespace("apmflow"),
            &["phase"],
        )?;

        // Register all metrics.
        // Workers
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(queue_capacity.clone()))?;
        registry.register(Box::new(queue_rejected.clone()))?;
        registry.register(Box::new(queue_evicted.clone()))?;

        // Aggregation
        registry.register(Box::new(aggregation_flushes.clone()))?;
        registry.register(Box::new(aggregation_records_emitted.clone()))?;

        // Remote
        registry.register(Box::new(cluster_size.clone()))?;
        registry.register(Box::new(remote_out_batches.clone()))?;
        registry.register(Box::new(remote_out_records.clone()))?;
        registry.register(Box::new(remote_out_errors.clone()))?;
        registry.register(Box::new(remote_batches_dropped.clone()))?;
        registry.register(Box::new(remote_queue_depth.clone()))?;
        registry.register(Box::new(remote_in_batches.clone()))?;
        registry.register(Box::new(remote_in_records.clone()))?;
        registry.register(Box::new(remote_in_unknown_graph.clone()))?;
        registry.register(Box::new(remote_in_malformed.clone()))?;

        // Persistence
        registry.register(Box::new(persistence_flush_duration.clone()))?;
        registry.register(Box::new(persistence_records_written.clone()))?;
        registry.register(Box::new(persistence_errors.clone()))?;
        registry.register(Box::new(persistence_evicted.clone()))?;
        registry.register(Box::new(persistence_conflicts.clone()))?;
        registry.register(Box::new(persistence_pending.clone()))?;
        registry.register(Box::new(storage_healthy.clone()))?;

        // Node
        registry.register(Box::new(node_start_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            messages_received,
            messages_dropped,
            queue_depth,
            queue_capacity,
            queue_rejected,
            queue_evicted,
            aggregation_flushes,
            aggregation_records_emitted,
            cluster_size,
            remote_out_batches,
            remote_out_records,
            remote_out_errors,
            remote_batches_dropped,
            remote_queue_depth,
            remote_in_batches,
            remote_in_records,
            remote_in_unknown_graph,
            remote_in_malformed,
            persistence_flush_duration,
            persistence_records_written,
            persistence_errors,
            persistence_evicted,
            persistence_conflicts,
            persistence_pending,
            storage_healthy,
            node_start_duration,
        })
    }

    /// Returns the models with at least one instance whose last storage
    /// write failed, sorted.
    pub fn degraded_models(&self) -> Vec<String> {
        degraded_models(&self.storage_healthy)
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Starts the HTTP server for /metrics and /healthz endpoints.
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            storage_healthy: self.storage_healthy.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn degraded_models(storage_healthy: &GaugeVec) -> Vec<String> {
    let mut models: Vec<String> = storage_healthy
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .filter(|metric| metric.get_gauge().get_value() < 1.0)
        .filter_map(|metric| {
            metric
                .get_label()
                .iter()
                .find(|label| label.get_name() == "model")
                .map(|label| label.get_value().to_string())
        })
        .collect();
    models.sort();
    models.dedup();
    models
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    storage_healthy: GaugeVec,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - 503 while any storage model is degraded.
async fn healthz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let degraded = degraded_models(&state.storage_healthy);
    if degraded.is_empty() {
        (StatusCode::OK, "ok".to_string())
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("storage degraded: {}", degraded.join(",")),
        )
    }
}
