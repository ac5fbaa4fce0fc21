use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analysis::{ServiceCall, ServicePipeline};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::graph::{Graph, GraphRegistry};
use crate::persistence::MemoryDao;
use crate::remote::{ClusterView, HttpTransport, InboundServer, Member, RemoteDispatcher};
use crate::worker::WorkerContext;

/// Node orchestrates all components: health server, graphs, remote
/// dispatch and the inbound endpoint.
pub struct Node {
    cfg: Config,
    health: Arc<HealthMetrics>,
    registry: Arc<GraphRegistry>,
    pipeline: Option<ServicePipeline<HttpTransport>>,
    inbound: Option<InboundServer>,
    cancel: CancellationToken,
}

impl Node {
    /// Creates a new Node, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            registry: Arc::new(GraphRegistry::new()),
            pipeline: None,
            inbound: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<GraphRegistry> {
        &self.registry
    }

    /// The ingestion graph, once started.
    pub fn ingest(&self) -> Option<&Arc<Graph<ServiceCall>>> {
        self.pipeline.as_ref().map(|p| p.ingest())
    }

    /// Start all components.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server so probes respond during startup.
        let started = Instant::now();
        self.health
            .start()
            .await
            .context("starting health metrics server")?;
        self.record_phase("health", started);

        // 1. Build the cluster view.
        let started = Instant::now();
        let local = Member::new(self.cfg.node_name.clone(), self.cfg.cluster.advertised());
        let view = Arc::new(
            ClusterView::new(local, self.cfg.cluster.members.clone())
                .context("building cluster view")?,
        );
        if view.len() == 1 {
            info!(node = %view.local().name, "running standalone");
        } else {
            info!(
                node = %view.local().name,
                members = view.len(),
                "cluster view built",
            );
        }
        self.record_phase("cluster", started);

        // 2. Start remote dispatch.
        let started = Instant::now();
        let transport = Arc::new(
            HttpTransport::new(self.cfg.remote.timeout).context("creating remote transport")?,
        );
        let dispatcher = RemoteDispatcher::start(
            Arc::clone(&view),
            Arc::clone(&self.registry),
            transport,
            self.cfg.remote.settings(),
            &self.health,
        );
        self.record_phase("remote", started);

        // 3. Assemble graphs and worker pools.
        let started = Instant::now();
        let ctx = WorkerContext {
            registry: Arc::clone(&self.registry),
            health: Arc::clone(&self.health),
            cancel: self.cancel.child_token(),
        };
        let pipeline = ServicePipeline::build(&self.cfg, &ctx, dispatcher, |model| {
            debug!(model, "using in-memory storage");
            Arc::new(MemoryDao::new())
        })
        .context("assembling service metrics pipeline")?;
        self.pipeline = Some(pipeline);
        self.record_phase("pipeline", started);

        // 4. Accept batches from peers once every graph exists.
        let started = Instant::now();
        let inbound = InboundServer::new(
            &self.cfg.cluster.listen_addr,
            Arc::clone(&self.registry),
            Arc::clone(&self.health),
        );
        let addr = inbound
            .start()
            .await
            .context("starting inbound batch server")?;
        info!(addr = %addr, "accepting remote batches");
        self.inbound = Some(inbound);
        self.record_phase("inbound", started);

        // 5. Start background monitors.
        self.spawn_storage_monitor();

        info!(graphs = ?self.registry.graph_ids(), "node fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop taking batches from peers before the stages they feed go away.
        if let Some(inbound) = self.inbound.take() {
            inbound.stop();
        }

        // Drain and flush every stage, upstream first.
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown().await;
        }

        // Signal background tasks to stop.
        self.cancel.cancel();

        let degraded = self.health.degraded_models();
        if !degraded.is_empty() {
            error!(models = ?degraded, "stopped with storage degraded");
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    fn record_phase(&self, phase: &str, started: Instant) {
        let elapsed = started.elapsed();
        self.health
            .node_start_duration
            .with_label_values(&[phase])
            .set(elapsed.as_secs_f64());
        debug!(phase, elapsed = ?elapsed, "startup phase done");
    }

    /// Spawn a background task that reports degraded storage models.
    fn spawn_storage_monitor(&self) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        let degraded = health.degraded_models();
                        if !degraded.is_empty() {
                            warn!(models = ?degraded, "storage degraded");
                        }
                    }
                }
            }
        });
    }
}
