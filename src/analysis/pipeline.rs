use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::aggregation::{self, AggregationSettings, FlushMode, MergeRecords};
use crate::config::Config;
use crate::graph::{Graph, NodeRef};
use crate::persistence::{self, PersistenceSettings, StorageDao};
use crate::record::{KeyedRecord, Step};
use crate::remote::{RemoteDispatcher, RemoteTransport};
use crate::worker::{Role, SelectionStrategy, WorkerContext, WorkerPool};

use super::service::{ServiceCall, ServiceCallTransform};

/// Ingestion graph: raw calls, reduced locally per minute.
pub const SERVICE_METRICS: &str = "service_metrics";
/// Cluster-level minute reduce, fed through remote dispatch.
pub const SERVICE_METRICS_REC: &str = "service_metrics_rec";
/// Re-buckets minute records into hours on the minute owner.
pub const SERVICE_METRICS_HOUR: &str = "service_metrics_hour";
/// Cluster-level hour reduce.
pub const SERVICE_METRICS_HOUR_REC: &str = "service_metrics_hour_rec";
/// Re-buckets hour records into days on the hour owner.
pub const SERVICE_METRICS_DAY: &str = "service_metrics_day";
/// Cluster-level day reduce.
pub const SERVICE_METRICS_DAY_REC: &str = "service_metrics_day_rec";

/// Storage models written by the pipeline.
pub const MINUTE_MODEL: &str = "service_metrics_minute";
pub const HOUR_MODEL: &str = "service_metrics_hour";
pub const DAY_MODEL: &str = "service_metrics_day";

/// The service metric graphs of one node and the pools behind them.
pub struct ServicePipeline<T: RemoteTransport> {
    ingest: Arc<Graph<ServiceCall>>,
    ingest_pool: Arc<WorkerPool<ServiceCall>>,
    /// Aggregation pools after ingestion, upstream first.
    reducers: Vec<Arc<WorkerPool<KeyedRecord>>>,
    persisters: Vec<Arc<WorkerPool<KeyedRecord>>>,
    dispatcher: Arc<RemoteDispatcher<T>>,
}

impl<T: RemoteTransport> ServicePipeline<T> {
    /// Builds every graph, downstream first, so that cross-graph lookups
    /// find their targets.
    ///
    /// `dao_for` returns the storage for a model name.
    pub fn build<D, F>(
        cfg: &Config,
        ctx: &WorkerContext,
        dispatcher: Arc<RemoteDispatcher<T>>,
        mut dao_for: F,
    ) -> Result<Self>
    where
        D: StorageDao,
        F: FnMut(&str) -> Arc<D>,
    {
        let mut reducers = Vec::new();
        let mut persisters = Vec::new();

        let mut persist = |model: &str| -> Result<_> {
            let settings = PersistenceSettings {
                role: Role::new(model, cfg.persistence.selector),
                size: cfg.persistence.pool_size,
                queue: cfg.persistence.queue,
                flush_interval: cfg.persistence.flush_interval,
                read_merge_write: cfg.persistence.read_merge_write,
                max_pending_records: cfg.persistence.max_pending_records,
            };
            let (pool, stage) = persistence::spawn_stage(settings, dao_for(model), ctx)
                .with_context(|| format!("spawning {model} persistence"))?;
            persisters.push(pool);
            Ok(stage)
        };

        let reducer = |role: &str, providers: Vec<NodeRef>| AggregationSettings {
            role: Role::new(role, SelectionStrategy::Affinity),
            size: cfg.aggregation.pool_size,
            queue: cfg.aggregation.internal_queue,
            mode: FlushMode::Cadence,
            flush_interval: cfg.aggregation.flush_interval,
            providers,
        };

        let registry = &ctx.registry;
        let mut rollups: Vec<Arc<WorkerPool<KeyedRecord>>> = Vec::new();

        // Day: hour record -> day bucket -> owner -> merge -> storage.
        if cfg.downsampling.day {
            let persist_day = persist(DAY_MODEL)?;
            let (merge_pool, merge) = aggregation::spawn_stage(
                reducer("service_metrics_day_merge", Vec::new()),
                MergeRecords,
                ctx,
            )
            .context("spawning day merge")?;
            registry
                .create_if_absent::<KeyedRecord>(SERVICE_METRICS_DAY_REC)
                .add_node("merge", merge)?
                .add_next("persist", persist_day)?;

            let (down_pool, down) = aggregation::spawn_downsample_stage(
                reducer("service_metrics_day_downsample", Vec::new()),
                Step::Day,
                ctx,
            )
            .context("spawning day downsample")?;
            registry
                .create_if_absent::<KeyedRecord>(SERVICE_METRICS_DAY)
                .add_node("downsample", down)?
                .add_next("dispatch", dispatcher.stage(SERVICE_METRICS_DAY_REC))?;

            rollups.push(down_pool);
            rollups.push(merge_pool);
        }

        // Hour: minute record -> hour bucket -> owner -> merge -> storage,
        // with the hour merge also feeding the day roll-up.
        if cfg.downsampling.hour {
            let persist_hour = persist(HOUR_MODEL)?;
            let day_provider = if cfg.downsampling.day {
                vec![NodeRef::new(SERVICE_METRICS_DAY, "downsample")]
            } else {
                Vec::new()
            };
            let (merge_pool, merge) = aggregation::spawn_stage(
                reducer("service_metrics_hour_merge", day_provider),
                MergeRecords,
                ctx,
            )
            .context("spawning hour merge")?;
            registry
                .create_if_absent::<KeyedRecord>(SERVICE_METRICS_HOUR_REC)
                .add_node("merge", merge)?
                .add_next("persist", persist_hour)?;

            let (down_pool, down) = aggregation::spawn_downsample_stage(
                reducer("service_metrics_hour_downsample", Vec::new()),
                Step::Hour,
                ctx,
            )
            .context("spawning hour downsample")?;
            registry
                .create_if_absent::<KeyedRecord>(SERVICE_METRICS_HOUR)
                .add_node("downsample", down)?
                .add_next("dispatch", dispatcher.stage(SERVICE_METRICS_HOUR_REC))?;

            rollups.insert(0, merge_pool);
            rollups.insert(0, down_pool);
        }

        // Minute: cluster-level merge -> storage, bridged into the hour graph.
        let persist_minute = persist(MINUTE_MODEL)?;
        let (merge_pool, merge) = aggregation::spawn_stage(
            reducer("service_metrics_merge", Vec::new()),
            MergeRecords,
            ctx,
        )
        .context("spawning minute merge")?;
        let merge = registry
            .create_if_absent::<KeyedRecord>(SERVICE_METRICS_REC)
            .add_node("merge", merge)?;
        merge.add_next("persist", persist_minute)?;
        if cfg.downsampling.hour {
            let hour = registry
                .find_node::<KeyedRecord>(SERVICE_METRICS_HOUR, "downsample")
                .context("bridging minute merge into hour graph")?;
            merge.bridge(hour);
        }
        reducers.push(merge_pool);
        reducers.extend(rollups);

        // Ingestion: local reduce -> owner of the minute record.
        let (ingest_pool, aggregate) = aggregation::spawn_stage(
            AggregationSettings {
                role: Role::new("service_metrics_aggregate", SelectionStrategy::Affinity),
                size: cfg.aggregation.pool_size,
                queue: cfg.aggregation.ingest_queue,
                mode: FlushMode::Cadence,
                flush_interval: cfg.aggregation.flush_interval,
                providers: Vec::new(),
            },
            ServiceCallTransform,
            ctx,
        )
        .context("spawning service call aggregation")?;
        let ingest = registry.create_if_absent::<ServiceCall>(SERVICE_METRICS);
        ingest
            .add_node("aggregate", aggregate)?
            .add_next("dispatch", dispatcher.stage(SERVICE_METRICS_REC))?;

        info!(
            graphs = registry.graph_ids().len(),
            hour = cfg.downsampling.hour,
            day = cfg.downsampling.day,
            "service metrics pipeline assembled",
        );

        Ok(Self {
            ingest,
            ingest_pool,
            reducers,
            persisters,
            dispatcher,
        })
    }

    /// The ingestion graph. Producers call `start` on it.
    pub fn ingest(&self) -> &Arc<Graph<ServiceCall>> {
        &self.ingest
    }

    /// Stops every stage upstream first, so each flush lands in a stage
    /// that is still running.
    pub async fn shutdown(&self) {
        self.ingest_pool.shutdown().await;
        for pool in &self.reducers {
            pool.shutdown().await;
        }
        self.dispatcher.shutdown().await;
        for pool in &self.persisters {
            pool.shutdown().await;
        }
        info!("service metrics pipeline stopped");
    }
}
