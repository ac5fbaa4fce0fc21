//! In-memory reduction of keyed records.
//!
//! An [`AggregationWorker`] turns each input into a [`KeyedRecord`] through
//! its [`Transform`], merges it into a reduction map keyed by record id and
//! emits the reduced records downstream once per flush window.

pub mod downsample;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use prometheus::Counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;
use crate::graph::{GraphRegistry, NodeRef, Outlet, Stage};
use crate::record::{BucketError, KeyedRecord};
use crate::worker::{
    QueueConfig, Role, RoutingKey, Sender, Worker, WorkerContext, WorkerError, WorkerPool,
};

pub use downsample::{spawn_downsample_stage, Downsample};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error(transparent)]
    Bucket(#[from] BucketError),

    #[error("invalid input: {0}")]
    Invalid(String),
}

/// Pure mapping from an input message to the record it contributes.
///
/// The record id must be derived from identity fields plus the time bucket,
/// so that every contribution to the same fact collides.
pub trait Transform: Clone + Send + Sync + 'static {
    type Input: RoutingKey + Send + 'static;

    fn transform(&self, input: Self::Input) -> Result<KeyedRecord, TransformError>;
}

/// Identity transform: reduces records that are already keyed.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeRecords;

impl Transform for MergeRecords {
    type Input = KeyedRecord;

    fn transform(&self, input: KeyedRecord) -> Result<KeyedRecord, TransformError> {
        Ok(input)
    }
}

/// When the reduction map is emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Emit on every pool tick.
    #[default]
    Cadence,
    /// Emit after every message.
    Immediate,
}

/// Per-role metric handles.
#[derive(Clone)]
struct AggregationMetrics {
    dropped_transform: Counter,
    dropped_merge: Counter,
    flushes: Counter,
    emitted: Counter,
}

impl AggregationMetrics {
    fn new(health: &HealthMetrics, role: &str) -> Self {
        Self {
            dropped_transform: health
                .messages_dropped
                .with_label_values(&[role, "transform"]),
            dropped_merge: health.messages_dropped.with_label_values(&[role, "merge"]),
            flushes: health.aggregation_flushes.with_label_values(&[role]),
            emitted: health.aggregation_records_emitted.with_label_values(&[role]),
        }
    }
}

/// Reduces records per id and emits them at the end of each window.
pub struct AggregationWorker<T: Transform> {
    name: String,
    transform: T,
    mode: FlushMode,
    reduction: HashMap<String, KeyedRecord>,
    /// Shared with every instance of the pool and wired by the graph.
    outlet: Outlet<KeyedRecord>,
    /// Downstream nodes in other graphs, resolved in `pre_start`.
    providers: Vec<NodeRef>,
    resolved: Outlet<KeyedRecord>,
    metrics: AggregationMetrics,
}

impl<T: Transform> AggregationWorker<T> {
    pub fn new(
        name: &str,
        transform: T,
        mode: FlushMode,
        outlet: Outlet<KeyedRecord>,
        health: &HealthMetrics,
    ) -> Self {
        Self {
            name: name.to_string(),
            transform,
            mode,
            reduction: HashMap::new(),
            outlet,
            providers: Vec::new(),
            resolved: Outlet::new(),
            metrics: AggregationMetrics::new(health, name),
        }
    }

    /// Also emits to `provider`, looked up in the registry at start.
    pub fn with_provider(mut self, provider: NodeRef) -> Self {
        self.providers.push(provider);
        self
    }

    /// Number of distinct record ids waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.reduction.len()
    }

    /// Emits every reduced record and clears the map.
    pub async fn flush(&mut self) {
        if self.reduction.is_empty() {
            return;
        }

        let records = std::mem::take(&mut self.reduction);
        let count = records.len();
        for record in records.into_values() {
            if self.resolved.target_count() > 0 {
                self.resolved.emit(record.clone()).await;
            }
            self.outlet.emit(record).await;
        }

        self.metrics.flushes.inc();
        self.metrics.emitted.inc_by(count as f64);
        debug!(worker = %self.name, records = count, "aggregation flushed");
    }
}

impl<T: Transform> Worker<T::Input> for AggregationWorker<T> {
    fn pre_start(&mut self, registry: &GraphRegistry) -> Result<(), WorkerError> {
        for provider in &self.providers {
            let sender = registry
                .find_node::<KeyedRecord>(&provider.graph_id, &provider.node_id)
                .map_err(|_| WorkerError::ProviderNotFound {
                    worker: self.name.clone(),
                    provider: provider.to_string(),
                })?;
            self.resolved.connect(sender);
        }
        Ok(())
    }

    async fn on_message(&mut self, input: T::Input) {
        let record = match self.transform.transform(input) {
            Ok(record) => record,
            Err(e) => {
                warn!(worker = %self.name, error = %e, "dropping message, transform failed");
                self.metrics.dropped_transform.inc();
                return;
            }
        };

        match self.reduction.entry(record.id().to_string()) {
            Entry::Occupied(mut slot) => {
                if let Err(e) = slot.get_mut().merge(&record) {
                    warn!(
                        worker = %self.name,
                        id = record.id(),
                        error = %e,
                        "dropping message, merge failed",
                    );
                    self.metrics.dropped_merge.inc();
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }

        if self.mode == FlushMode::Immediate {
            self.flush().await;
        }
    }

    async fn on_tick(&mut self) {
        self.flush().await;
    }

    async fn on_stop(&mut self) {
        self.flush().await;
    }
}

/// Settings for one aggregation stage.
#[derive(Debug, Clone)]
pub struct AggregationSettings {
    pub role: Role,
    pub size: usize,
    pub queue: QueueConfig,
    pub mode: FlushMode,
    pub flush_interval: Duration,
    pub providers: Vec<NodeRef>,
}

/// Spawns an aggregation pool and returns it together with the graph stage
/// that wraps it.
pub fn spawn_stage<T: Transform>(
    settings: AggregationSettings,
    transform: T,
    ctx: &WorkerContext,
) -> Result<(Arc<WorkerPool<T::Input>>, Stage<T::Input, KeyedRecord>), WorkerError> {
    let outlet = Outlet::<KeyedRecord>::new();
    let tick = match settings.mode {
        FlushMode::Cadence => Some(settings.flush_interval),
        FlushMode::Immediate => None,
    };

    let pool = Arc::new(WorkerPool::<T::Input>::spawn(
        settings.role.clone(),
        settings.size,
        settings.queue,
        tick,
        ctx,
        |_| {
            let mut worker = AggregationWorker::new(
                &settings.role.name,
                transform.clone(),
                settings.mode,
                outlet.clone(),
                &ctx.health,
            );
            for provider in &settings.providers {
                worker = worker.with_provider(provider.clone());
            }
            worker
        },
    )?);

    let input: Arc<dyn Sender<T::Input>> = pool.clone();
    Ok((pool, Stage::new(input, outlet)))
}
