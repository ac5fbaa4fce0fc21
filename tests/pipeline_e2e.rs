use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use apmflow::analysis::{ServiceCall, ServicePipeline, DAY_MODEL, HOUR_MODEL, MINUTE_MODEL};
use apmflow::config::Config;
use apmflow::export::health::HealthMetrics;
use apmflow::graph::GraphRegistry;
use apmflow::persistence::MemoryDao;
use apmflow::record::codec::Compression;
use apmflow::remote::{
    handle_batch, ClusterView, Member, RemoteDispatcher, RemoteSettings, RemoteTransport,
};
use apmflow::worker::WorkerContext;

// 2024-01-01T12:30:15Z
const TS: i64 = 1_704_112_215_000;

/// Delivers batches in-process through the inbound batch handler.
#[derive(Default)]
struct Loopback {
    peers: RwLock<HashMap<String, (Arc<GraphRegistry>, Arc<HealthMetrics>)>>,
}

impl RemoteTransport for Loopback {
    async fn send(
        &self,
        member: &Member,
        payload: &[u8],
        compression: Compression,
    ) -> anyhow::Result<()> {
        let (registry, health) = self
            .peers
            .read()
            .get(&member.name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown member {}", member.name))?;
        handle_batch(&registry, &health, payload, compression.content_encoding()).await?;
        Ok(())
    }
}

struct TestNode {
    name: String,
    view: Arc<ClusterView>,
    health: Arc<HealthMetrics>,
    pipeline: ServicePipeline<Loopback>,
    daos: HashMap<&'static str, Arc<MemoryDao>>,
}

impl TestNode {
    fn dao(&self, model: &str) -> &MemoryDao {
        &self.daos[model]
    }
}

fn config(name: &str) -> Config {
    let mut cfg = Config {
        node_name: name.to_string(),
        ..Default::default()
    };
    cfg.aggregation.pool_size = 2;
    cfg.aggregation.flush_interval = Duration::from_secs(1);
    cfg.persistence.pool_size = 2;
    cfg.persistence.flush_interval = Duration::from_secs(3);
    cfg
}

fn cluster(names: &[&str]) -> Vec<TestNode> {
    let members: Vec<Member> = names
        .iter()
        .map(|n| Member::new(*n, format!("{n}:11800")))
        .collect();
    let transport = Arc::new(Loopback::default());

    let mut nodes = Vec::new();
    for member in &members {
        let registry = Arc::new(GraphRegistry::new());
        let health = Arc::new(HealthMetrics::new("127.0.0.1:0").unwrap());
        transport.peers.write().insert(
            member.name.clone(),
            (Arc::clone(&registry), Arc::clone(&health)),
        );

        let view = Arc::new(ClusterView::new(member.clone(), members.clone()).unwrap());
        let dispatcher = RemoteDispatcher::start(
            Arc::clone(&view),
            Arc::clone(&registry),
            Arc::clone(&transport),
            RemoteSettings::default(),
            &health,
        );

        let daos: HashMap<&'static str, Arc<MemoryDao>> = [MINUTE_MODEL, HOUR_MODEL, DAY_MODEL]
            .into_iter()
            .map(|m| (m, Arc::new(MemoryDao::new())))
            .collect();

        let ctx = WorkerContext {
            registry,
            health: Arc::clone(&health),
            cancel: CancellationToken::new(),
        };
        let pipeline =
            ServicePipeline::build(&config(&member.name), &ctx, dispatcher, |model| {
                Arc::clone(&daos[model])
            })
            .unwrap();

        nodes.push(TestNode {
            name: member.name.clone(),
            view,
            health,
            pipeline,
            daos,
        });
    }
    nodes
}

async fn shutdown(nodes: &[TestNode]) {
    for node in nodes {
        node.pipeline.shutdown().await;
    }
}

/// Returns (holder, calls) for every node storing `id` under `model`.
fn stored_calls(nodes: &[TestNode], model: &str, id: &str) -> Vec<(String, i64)> {
    nodes
        .iter()
        .filter_map(|n| {
            n.dao(model)
                .get(id)
                .and_then(|r| r.long("calls"))
                .map(|calls| (n.name.clone(), calls))
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_standalone_two_calls_persist_as_two() {
    let nodes = cluster(&["node-a"]);
    let ingest = nodes[0].pipeline.ingest();

    ingest.start(ServiceCall::new("svcA", TS, 10, false)).await.unwrap();
    ingest
        .start(ServiceCall::new("svcA", TS + 1_000, 30, true))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;

    let minute = nodes[0].dao(MINUTE_MODEL).get("202401011230_svcA").unwrap();
    assert_eq!(minute.long("calls"), Some(2));
    assert_eq!(minute.long("errors"), Some(1));
    assert_eq!(minute.long("latency_sum"), Some(40));

    let hour = nodes[0].dao(HOUR_MODEL).get("2024010112_svcA").unwrap();
    assert_eq!(hour.long("calls"), Some(2));
    let day = nodes[0].dao(DAY_MODEL).get("20240101_svcA").unwrap();
    assert_eq!(day.long("calls"), Some(2));

    shutdown(&nodes).await;
}

#[tokio::test(start_paused = true)]
async fn test_cluster_reduces_on_owner_only() {
    let nodes = cluster(&["node-a", "node-b", "node-c"]);

    // Every node sees calls for both services in the same minute.
    for (i, node) in nodes.iter().enumerate() {
        for service in ["svcA", "svcB"] {
            for n in 0..=i as i64 {
                node.pipeline
                    .ingest()
                    .start(ServiceCall::new(service, TS + n * 1_000, 5, false))
                    .await
                    .unwrap();
            }
        }
    }

    tokio::time::sleep(Duration::from_secs(30)).await;

    // 1 + 2 + 3 calls per service, each id stored by exactly its owner.
    for service in ["svcA", "svcB"] {
        for (model, id) in [
            (MINUTE_MODEL, format!("202401011230_{service}")),
            (HOUR_MODEL, format!("2024010112_{service}")),
            (DAY_MODEL, format!("20240101_{service}")),
        ] {
            let holders = stored_calls(&nodes, model, &id);
            assert_eq!(holders.len(), 1, "{id} stored on {holders:?}");
            assert_eq!(holders[0].1, 6, "{id}");
            assert_eq!(holders[0].0, nodes[0].view.owner(&id).name, "{id}");
        }
    }

    let remote_in: f64 = nodes
        .iter()
        .map(|n| n.health.remote_in_records.get())
        .sum();
    assert!(remote_in > 0.0);

    shutdown(&nodes).await;
}

#[tokio::test(start_paused = true)]
async fn test_owner_agrees_across_members() {
    let nodes = cluster(&["node-a", "node-b", "node-c"]);

    let owners: Vec<String> = nodes
        .iter()
        .map(|n| n.view.owner("k").name.clone())
        .collect();
    assert!(owners.iter().all(|o| *o == owners[0]));

    shutdown(&nodes).await;
}

#[tokio::test(start_paused = true)]
async fn test_storage_outage_recovers_without_double_count() {
    let nodes = cluster(&["node-a"]);
    let node = &nodes[0];
    let minute = node.dao(MINUTE_MODEL);

    node.pipeline
        .ingest()
        .start(ServiceCall::new("svcA", TS, 1, false))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        minute.get("202401011230_svcA").unwrap().long("calls"),
        Some(1)
    );

    minute.set_failing(true);
    node.pipeline
        .ingest()
        .start(ServiceCall::new("svcA", TS + 2_000, 1, false))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(node.health.degraded_models(), vec![MINUTE_MODEL.to_string()]);

    // More data for the same minute while storage is down.
    node.pipeline
        .ingest()
        .start(ServiceCall::new("svcA", TS + 4_000, 1, false))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    minute.set_failing(false);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(node.health.degraded_models().is_empty());
    assert_eq!(
        minute.get("202401011230_svcA").unwrap().long("calls"),
        Some(3)
    );

    shutdown(&nodes).await;
}
