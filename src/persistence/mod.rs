//! Persistence: buffers reduced records per id and writes them to storage
//! in batches on every flush tick.

pub mod memory;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use prometheus::{Counter, Gauge, Histogram};
use tracing::{debug, error, warn};

use crate::export::health::HealthMetrics;
use crate::graph::Stage;
use crate::record::KeyedRecord;
use crate::worker::{QueueConfig, Role, Sender, Worker, WorkerContext, WorkerError, WorkerPool};

pub use memory::MemoryDao;

/// Storage contract for one record model.
pub trait StorageDao: Send + Sync + 'static {
    /// Loads the stored record with `id`, if any.
    fn get_by_id(&self, id: &str) -> impl Future<Output = Result<Option<KeyedRecord>>> + Send;

    /// Writes `records`, overwriting any stored record with the same id.
    fn upsert(&self, records: Vec<KeyedRecord>) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone)]
struct PersistenceMetrics {
    flush_duration: Histogram,
    written: Counter,
    errors: Counter,
    evicted: Counter,
    conflicts: Counter,
    dropped_merge: Counter,
    pending: Gauge,
    healthy: Gauge,
}

impl PersistenceMetrics {
    fn new(health: &HealthMetrics, model: &str, instance: usize) -> Self {
        let instance = instance.to_string();
        Self {
            flush_duration: health
                .persistence_flush_duration
                .with_label_values(&[model]),
            written: health
                .persistence_records_written
                .with_label_values(&[model]),
            errors: health.persistence_errors.with_label_values(&[model]),
            evicted: health.persistence_evicted.with_label_values(&[model]),
            conflicts: health.persistence_conflicts.with_label_values(&[model]),
            dropped_merge: health.messages_dropped.with_label_values(&[model, "merge"]),
            pending: health
                .persistence_pending
                .with_label_values(&[model, instance.as_str()]),
            healthy: health
                .storage_healthy
                .with_label_values(&[model, instance.as_str()]),
        }
    }
}

/// Result of one write attempt that reached storage.
struct Written {
    records: usize,
    /// Records that could not be merged with their stored state.
    conflicts: HashMap<String, KeyedRecord>,
}

/// Accumulates records between flushes and writes them with read-merge-write.
pub struct PersistenceWorker<D: StorageDao> {
    model: String,
    dao: Arc<D>,
    pending: HashMap<String, KeyedRecord>,
    read_merge_write: bool,
    max_pending_records: usize,
    metrics: PersistenceMetrics,
}

impl<D: StorageDao> PersistenceWorker<D> {
    /// `instance` is the worker's index in its pool and labels the
    /// per-instance gauges.
    pub fn new(
        model: &str,
        instance: usize,
        dao: Arc<D>,
        read_merge_write: bool,
        max_pending_records: usize,
        health: &HealthMetrics,
    ) -> Self {
        let metrics = PersistenceMetrics::new(health, model, instance);
        metrics.healthy.set(1.0);

        Self {
            model: model.to_string(),
            dao,
            pending: HashMap::new(),
            read_merge_write,
            max_pending_records,
            metrics,
        }
    }

    /// Number of distinct record ids waiting to be written.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Merges `record` into the pending entry with the same id.
    fn absorb(&mut self, record: KeyedRecord) {
        match self.pending.entry(record.id().to_string()) {
            Entry::Occupied(mut slot) => {
                if let Err(e) = slot.get_mut().merge(&record) {
                    warn!(
                        model = %self.model,
                        id = record.id(),
                        error = %e,
                        "dropping record, merge failed",
                    );
                    self.metrics.dropped_merge.inc();
                }
            }
            Entry::Vacant(slot) => {
                self.metrics.pending.inc();
                slot.insert(record);
            }
        }
    }

    /// Writes every pending record. Records that failed to write, or that
    /// conflict with their stored state, are kept for the next attempt and
    /// `false` is returned.
    pub async fn flush(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }

        let batch = std::mem::take(&mut self.pending);
        self.metrics.pending.set(0.0);
        let started = Instant::now();

        let result = self.write(&batch).await;
        self.metrics
            .flush_duration
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(Written { records, conflicts }) => {
                self.metrics.written.inc_by(records as f64);
                debug!(model = %self.model, records, "persisted batch");
                if conflicts.is_empty() {
                    self.metrics.healthy.set(1.0);
                    return true;
                }

                error!(
                    model = %self.model,
                    records = conflicts.len(),
                    "records conflict with stored state, holding them back",
                );
                self.metrics.conflicts.inc_by(conflicts.len() as f64);
                self.metrics.healthy.set(0.0);
                self.restore(conflicts);
                self.evict_overflow();
                false
            }
            Err(e) => {
                error!(
                    model = %self.model,
                    records = batch.len(),
                    error = format!("{e:#}"),
                    "persist failed, keeping records for retry",
                );
                self.metrics.errors.inc();
                self.metrics.healthy.set(0.0);
                self.restore(batch);
                self.evict_overflow();
                false
            }
        }
    }

    /// Reads stored state for accumulating records, merges, and upserts the
    /// batch. A record whose stored state cannot be merged is left out of
    /// the upsert and returned as a conflict; the stored record is never
    /// overwritten by a bare delta. `batch` itself is never modified.
    async fn write(&self, batch: &HashMap<String, KeyedRecord>) -> Result<Written> {
        let mut out = Vec::with_capacity(batch.len());
        let mut conflicts = HashMap::new();

        for record in batch.values() {
            if self.read_merge_write && record.has_sum_columns() {
                let stored = self
                    .dao
                    .get_by_id(record.id())
                    .await
                    .with_context(|| format!("reading {}", record.id()))?;

                if let Some(mut stored) = stored {
                    match stored.merge_by_name(record) {
                        Ok(()) => out.push(stored),
                        Err(e) => {
                            warn!(
                                model = %self.model,
                                id = record.id(),
                                error = %e,
                                "stored record cannot be merged",
                            );
                            conflicts.insert(record.id().to_string(), record.clone());
                        }
                    }
                    continue;
                }
            }
            out.push(record.clone());
        }

        let records = out.len();
        if records > 0 {
            self.dao
                .upsert(out)
                .await
                .with_context(|| format!("upserting {records} {} records", self.model))?;
        }

        Ok(Written { records, conflicts })
    }

    /// Puts a failed batch back, merging it with records that arrived since.
    fn restore(&mut self, batch: HashMap<String, KeyedRecord>) {
        for (id, mut record) in batch {
            if let Some(newer) = self.pending.remove(&id) {
                if let Err(e) = record.merge(&newer) {
                    warn!(model = %self.model, id = %id, error = %e, "dropping record, merge failed");
                    self.metrics.dropped_merge.inc();
                }
            }
            self.pending.insert(id, record);
        }
        self.metrics.pending.set(self.pending.len() as f64);
    }

    /// Drops the oldest time buckets until pending fits the limit.
    fn evict_overflow(&mut self) {
        let excess = self.pending.len().saturating_sub(self.max_pending_records);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(i64, String)> = self
            .pending
            .values()
            .map(|r| (r.time_bucket(), r.id().to_string()))
            .collect();
        by_age.sort();

        for (_, id) in by_age.into_iter().take(excess) {
            self.pending.remove(&id);
        }

        error!(
            model = %self.model,
            evicted = excess,
            limit = self.max_pending_records,
            "pending records over limit, evicted oldest buckets",
        );
        self.metrics.evicted.inc_by(excess as f64);
        self.metrics.pending.set(self.pending.len() as f64);
    }
}

impl<D: StorageDao> Worker<KeyedRecord> for PersistenceWorker<D> {
    async fn on_message(&mut self, record: KeyedRecord) {
        self.absorb(record);
    }

    async fn on_tick(&mut self) {
        self.flush().await;
    }

    async fn on_stop(&mut self) {
        if !self.flush().await {
            error!(
                model = %self.model,
                records = self.pending.len(),
                "final flush failed, records lost",
            );
        }
    }
}

/// Settings for one persistence stage.
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    pub role: Role,
    pub size: usize,
    pub queue: QueueConfig,
    pub flush_interval: Duration,
    pub read_merge_write: bool,
    pub max_pending_records: usize,
}

/// Spawns a persistence pool writing to `dao` and returns it with its
/// terminal graph stage.
pub fn spawn_stage<D: StorageDao>(
    settings: PersistenceSettings,
    dao: Arc<D>,
    ctx: &WorkerContext,
) -> Result<(Arc<WorkerPool<KeyedRecord>>, Stage<KeyedRecord, Infallible>), WorkerError> {
    let pool = Arc::new(WorkerPool::<KeyedRecord>::spawn(
        settings.role.clone(),
        settings.size,
        settings.queue,
        Some(settings.flush_interval),
        ctx,
        |index| {
            PersistenceWorker::new(
                &settings.role.name,
                index,
                Arc::clone(&dao),
                settings.read_merge_write,
                settings.max_pending_records,
                &ctx.health,
            )
        },
    )?);

    let input: Arc<dyn Sender<KeyedRecord>> = pool.clone();
    Ok((pool, Stage::terminal(input)))
}
