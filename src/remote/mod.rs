//! Cluster-aware dispatch of keyed records.
//!
//! Each record id has exactly one owner in the cluster. Records owned by
//! this node go straight into the local graph. Everything else is queued
//! per owner and shipped in compressed batches by one sender task per peer.

pub mod client;
pub mod cluster;
pub mod server;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::{Counter, Gauge};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::export::health::HealthMetrics;
use crate::graph::{GraphError, GraphRegistry, Stage};
use crate::record::codec::{self, Compression, RemoteBatch, RemoteEnvelope};
use crate::record::KeyedRecord;
use crate::worker::{
    AcceptError, AcceptFuture, OverflowPolicy, QueueConfig, QueueError, Sender, WorkQueue,
};

pub use client::{HttpTransport, RemoteTransport, RetryPolicy, BATCH_PATH};
pub use cluster::{ClusterView, Member};
pub use server::{handle_batch, InboundServer, InboundSummary};

/// Outbound batching and retry settings.
#[derive(Debug, Clone, Copy)]
pub struct RemoteSettings {
    pub batch_size: usize,
    pub queue_size: usize,
    pub compression: Compression,
    pub retry: RetryPolicy,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            batch_size: 256,
            queue_size: 10_000,
            compression: Compression::default(),
            retry: RetryPolicy {
                max_retries: 3,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(5),
                timeout: Duration::from_secs(10),
            },
        }
    }
}

/// Routes each record to the graph of the member that owns its id.
pub struct RemoteDispatcher<T: RemoteTransport> {
    view: Arc<ClusterView>,
    registry: Arc<GraphRegistry>,
    outbound: HashMap<String, Arc<WorkQueue<RemoteEnvelope>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    _transport: Arc<T>,
}

impl<T: RemoteTransport> RemoteDispatcher<T> {
    /// Creates the dispatcher and spawns one sender task per peer.
    pub fn start(
        view: Arc<ClusterView>,
        registry: Arc<GraphRegistry>,
        transport: Arc<T>,
        settings: RemoteSettings,
        health: &Arc<HealthMetrics>,
    ) -> Arc<Self> {
        health.cluster_size.set(view.len() as f64);

        let mut outbound = HashMap::new();
        let mut handles = Vec::new();
        for peer in view.peers() {
            let queue = Arc::new(WorkQueue::new(QueueConfig {
                capacity: settings.queue_size,
                overflow: OverflowPolicy::Block,
            }));
            outbound.insert(peer.name.clone(), Arc::clone(&queue));

            let metrics = SenderMetrics::new(health, &peer.name);
            handles.push(tokio::spawn(run_sender(
                peer.clone(),
                queue,
                Arc::clone(&transport),
                settings,
                metrics,
            )));
        }

        info!(
            local = %view.local().name,
            members = view.len(),
            compression = ?settings.compression,
            batch_size = settings.batch_size,
            "remote dispatcher started",
        );

        Arc::new(Self {
            view,
            registry,
            outbound,
            handles: Mutex::new(handles),
            _transport: transport,
        })
    }

    pub fn view(&self) -> &ClusterView {
        &self.view
    }

    /// Delivers `record` to graph `graph_id` on the member owning its id.
    pub async fn send(&self, graph_id: &str, record: KeyedRecord) -> Result<(), GraphError> {
        let owner = self.view.owner(record.id());
        if self.view.is_local(owner) {
            let graph = self.registry.graph::<KeyedRecord>(graph_id)?;
            return graph.start(record).await;
        }

        let queue = self.outbound.get(&owner.name).ok_or_else(|| {
            GraphError::Accept(AcceptError::Closed {
                worker: format!("remote/{}", owner.name),
            })
        })?;

        let envelope = RemoteEnvelope {
            graph_id: graph_id.to_string(),
            record,
        };
        match queue.push(envelope).await {
            Ok(_) => Ok(()),
            Err(QueueError::Full) => Err(GraphError::Accept(AcceptError::Rejected {
                worker: format!("remote/{}", owner.name),
            })),
            Err(QueueError::Closed) => Err(GraphError::Accept(AcceptError::Closed {
                worker: format!("remote/{}", owner.name),
            })),
        }
    }

    /// Wraps the dispatcher as a terminal graph stage targeting `graph_id`.
    pub fn stage(self: &Arc<Self>, graph_id: &str) -> Stage<KeyedRecord, Infallible> {
        let input: Arc<dyn Sender<KeyedRecord>> = Arc::new(RemoteStage {
            name: format!("remote->{graph_id}"),
            graph_id: graph_id.to_string(),
            dispatcher: Arc::clone(self),
        });
        Stage::terminal(input)
    }

    /// Closes the outbound queues and waits for the senders to flush them.
    pub async fn shutdown(&self) {
        for queue in self.outbound.values() {
            queue.close();
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "remote sender join failed");
            }
        }
        info!("remote dispatcher stopped");
    }
}

/// Graph node forwarding records through the dispatcher.
struct RemoteStage<T: RemoteTransport> {
    name: String,
    graph_id: String,
    dispatcher: Arc<RemoteDispatcher<T>>,
}

impl<T: RemoteTransport> Sender<KeyedRecord> for RemoteStage<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&self, msg: KeyedRecord) -> AcceptFuture<'_> {
        Box::pin(async move {
            match self.dispatcher.send(&self.graph_id, msg).await {
                Ok(()) => Ok(()),
                Err(GraphError::Accept(e)) => Err(e),
                Err(e) => Err(AcceptError::Unroutable {
                    worker: self.name.clone(),
                    reason: e.to_string(),
                }),
            }
        })
    }
}

#[derive(Clone)]
struct SenderMetrics {
    batches: Counter,
    records: Counter,
    errors: Counter,
    dropped: Counter,
    depth: Gauge,
}

impl SenderMetrics {
    fn new(health: &HealthMetrics, member: &str) -> Self {
        Self {
            batches: health.remote_out_batches.with_label_values(&[member]),
            records: health.remote_out_records.with_label_values(&[member]),
            errors: health.remote_out_errors.with_label_values(&[member]),
            dropped: health.remote_batches_dropped.with_label_values(&[member]),
            depth: health.remote_queue_depth.with_label_values(&[member]),
        }
    }
}

async fn run_sender<T: RemoteTransport>(
    member: Member,
    queue: Arc<WorkQueue<RemoteEnvelope>>,
    transport: Arc<T>,
    settings: RemoteSettings,
    metrics: SenderMetrics,
) {
    while let Some(entries) = queue.pop_batch(settings.batch_size).await {
        metrics.depth.set(queue.len() as f64);

        let count = entries.len();
        let batch = RemoteBatch { entries };
        let payload = match codec::encode(&batch, settings.compression) {
            Ok(payload) => payload,
            Err(e) => {
                error!(member = %member.name, records = count, error = %e, "encoding remote batch");
                metrics.errors.inc();
                metrics.dropped.inc();
                continue;
            }
        };

        match settings
            .retry
            .send_with_retry(
                transport.as_ref(),
                &member,
                &payload,
                settings.compression,
                &metrics.errors,
            )
            .await
        {
            Ok(()) => {
                metrics.batches.inc();
                metrics.records.inc_by(count as f64);
                debug!(member = %member.name, records = count, bytes = payload.len(), "remote batch sent");
            }
            Err(e) => {
                metrics.dropped.inc();
                error!(
                    member = %member.name,
                    records = count,
                    error = %e,
                    "dropping remote batch",
                );
            }
        }
    }

    debug!(member = %member.name, "remote sender stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use anyhow::{bail, Result};

    use super::*;
    use crate::graph::tests::Capture as StageCapture;
    use crate::record::{Column, Value};

    /// Captures decoded batches; fails the first `failures` calls.
    struct Capture {
        failures: u32,
        calls: AtomicU32,
        batches: Mutex<Vec<(String, RemoteBatch)>>,
    }

    impl Capture {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
                batches: Mutex::new(Vec::new()),
            })
        }
    }

    impl RemoteTransport for Capture {
        async fn send(&self, member: &Member, payload: &[u8], compression: Compression) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                bail!("unreachable member");
            }
            let batch = codec::decode(payload, compression)?;
            self.batches.lock().push((member.name.clone(), batch));
            Ok(())
        }
    }

    fn settings(max_retries: u32) -> RemoteSettings {
        RemoteSettings {
            batch_size: 16,
            queue_size: 64,
            compression: Compression::Gzip,
            retry: RetryPolicy {
                max_retries,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
                timeout: Duration::from_secs(1),
            },
        }
    }

    fn record(entity: &str) -> KeyedRecord {
        KeyedRecord::new(entity, 202401011230).with_column(Column::sum("calls", Value::Long(1)))
    }

    /// Three members; returns the view of `local`.
    fn view(local: &str) -> Arc<ClusterView> {
        let members = vec![
            Member::new("node-a", "a:11800"),
            Member::new("node-b", "b:11800"),
            Member::new("node-c", "c:11800"),
        ];
        let me = members
            .iter()
            .find(|m| m.name == local)
            .cloned()
            .unwrap();
        Arc::new(ClusterView::new(me, members).unwrap())
    }

    fn health() -> Arc<HealthMetrics> {
        Arc::new(HealthMetrics::new("127.0.0.1:0").unwrap())
    }

    #[tokio::test]
    async fn test_local_owner_starts_local_graph() {
        let registry = Arc::new(GraphRegistry::new());
        let capture = StageCapture::<KeyedRecord>::new("merge");
        registry
            .create_if_absent::<KeyedRecord>("rec")
            .add_node("merge", capture.stage())
            .unwrap();

        let transport = Capture::new(0);
        let standalone = Arc::new(ClusterView::standalone(Member::new("solo", "s:1")).unwrap());
        let dispatcher = RemoteDispatcher::start(
            standalone,
            Arc::clone(&registry),
            Arc::clone(&transport),
            settings(0),
            &health(),
        );

        dispatcher.send("rec", record("svcA")).await.unwrap();
        dispatcher.shutdown().await;

        assert_eq!(capture.seen.lock().len(), 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_owner_receives_batch() {
        let registry = Arc::new(GraphRegistry::new());
        let transport = Capture::new(0);
        let health = health();
        let view_a = view("node-a");
        let dispatcher = RemoteDispatcher::start(
            Arc::clone(&view_a),
            registry,
            Arc::clone(&transport),
            settings(0),
            &health,
        );

        // Find an entity owned by someone else.
        let entity = (0..100)
            .map(|i| format!("svc{i}"))
            .find(|e| !view_a.is_local(view_a.owner(record(e).id())))
            .unwrap();
        let owner = view_a.owner(record(&entity).id()).name.clone();

        dispatcher.send("rec", record(&entity)).await.unwrap();
        dispatcher.shutdown().await;

        let batches = transport.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, owner);
        assert_eq!(batches[0].1.entries[0].graph_id, "rec");
        assert_eq!(batches[0].1.entries[0].record, record(&entity));
        assert_eq!(
            health
                .remote_out_records
                .with_label_values(&[owner.as_str()])
                .get(),
            1.0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_drop_batch() {
        let registry = Arc::new(GraphRegistry::new());
        let transport = Capture::new(3);
        let health = health();
        let view_a = view("node-a");
        let dispatcher = RemoteDispatcher::start(
            Arc::clone(&view_a),
            registry,
            Arc::clone(&transport),
            settings(2),
            &health,
        );

        let remote: Vec<String> = (0..200)
            .map(|i| format!("svc{i}"))
            .filter(|e| view_a.owner(record(e).id()).name == "node-b")
            .take(2)
            .collect();

        // First batch fails three times and is dropped; the second goes out.
        dispatcher.send("rec", record(&remote[0])).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        dispatcher.send("rec", record(&remote[1])).await.unwrap();
        dispatcher.shutdown().await;

        let batches = transport.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.entries[0].record.entity_id(), remote[1]);
        assert_eq!(
            health.remote_batches_dropped.with_label_values(&["node-b"]).get(),
            1.0
        );
        assert_eq!(
            health.remote_out_errors.with_label_values(&["node-b"]).get(),
            3.0
        );
    }

    #[tokio::test]
    async fn test_stage_reports_unknown_graph() {
        let registry = Arc::new(GraphRegistry::new());
        let standalone = Arc::new(ClusterView::standalone(Member::new("solo", "s:1")).unwrap());
        let dispatcher = RemoteDispatcher::start(
            standalone,
            registry,
            Capture::new(0),
            settings(0),
            &health(),
        );

        let stage = dispatcher.stage("missing");
        let err = stage.input.accept(record("svcA")).await.unwrap_err();
        assert!(matches!(err, AcceptError::Unroutable { .. }));
    }
}
