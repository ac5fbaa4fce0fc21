use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::export::health::HealthMetrics;
use crate::graph::GraphRegistry;
use crate::record::codec::{self, CodecError, Compression};
use crate::record::KeyedRecord;

use super::client::BATCH_PATH;

/// Outcome of one inbound batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundSummary {
    pub accepted: usize,
    pub unknown_graph: usize,
    pub rejected: usize,
}

/// Decodes a batch and starts each envelope on its graph.
///
/// Envelopes for unknown graphs, or refused by their graph, are logged and
/// counted without affecting the rest of the batch.
pub async fn handle_batch(
    registry: &GraphRegistry,
    health: &HealthMetrics,
    body: &[u8],
    encoding: Option<&str>,
) -> Result<InboundSummary, CodecError> {
    let compression = Compression::from_content_encoding(encoding)?;
    let batch = codec::decode(body, compression)?;

    health.remote_in_batches.inc();

    let mut summary = InboundSummary::default();
    for envelope in batch.entries {
        let graph = match registry.graph::<KeyedRecord>(&envelope.graph_id) {
            Ok(graph) => graph,
            Err(e) => {
                warn!(graph = %envelope.graph_id, error = %e, "inbound record for unknown graph");
                health.remote_in_unknown_graph.inc();
                summary.unknown_graph += 1;
                continue;
            }
        };

        match graph.start(envelope.record).await {
            Ok(()) => {
                health.remote_in_records.inc();
                summary.accepted += 1;
            }
            Err(e) => {
                warn!(graph = %envelope.graph_id, error = %e, "inbound record refused");
                health
                    .messages_dropped
                    .with_label_values(&["remote_in", "rejected"])
                    .inc();
                summary.rejected += 1;
            }
        }
    }

    debug!(
        accepted = summary.accepted,
        unknown_graph = summary.unknown_graph,
        rejected = summary.rejected,
        "inbound batch handled",
    );

    Ok(summary)
}

/// Shared state for the inbound handler.
struct InboundState {
    registry: Arc<GraphRegistry>,
    health: Arc<HealthMetrics>,
}

/// Builds the router serving the inbound batch endpoint.
pub fn router(registry: Arc<GraphRegistry>, health: Arc<HealthMetrics>) -> Router {
    Router::new()
        .route(BATCH_PATH, post(batch_handler))
        .with_state(Arc::new(InboundState { registry, health }))
}

/// POST /remote/v1/batch
async fn batch_handler(
    State(state): State<Arc<InboundState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());

    match handle_batch(&state.registry, &state.health, &body, encoding).await {
        Ok(summary) => (
            StatusCode::OK,
            format!(
                "accepted={} unknown_graph={} rejected={}",
                summary.accepted, summary.unknown_graph, summary.rejected
            ),
        ),
        Err(e) => {
            warn!(error = %e, "malformed inbound batch");
            state.health.remote_in_malformed.inc();
            (StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

/// HTTP server for batches sent by other members.
pub struct InboundServer {
    addr: String,
    registry: Arc<GraphRegistry>,
    health: Arc<HealthMetrics>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl InboundServer {
    pub fn new(addr: &str, registry: Arc<GraphRegistry>, health: Arc<HealthMetrics>) -> Self {
        Self {
            addr: addr.to_string(),
            registry,
            health,
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the listener and serves in the background. Returns the bound
    /// address.
    pub async fn start(&self) -> Result<SocketAddr> {
        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app = router(Arc::clone(&self.registry), Arc::clone(&self.health));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            info!(addr = %local_addr, "inbound batch server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                error!(error = %e, "inbound batch server error");
            }
        });

        Ok(local_addr)
    }

    /// Stops accepting batches.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}
