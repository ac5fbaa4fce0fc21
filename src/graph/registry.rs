use std::any::{type_name, Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::{Graph, GraphCore, GraphError};
use crate::worker::Sender;

struct Registered {
    payload_name: &'static str,
    graph: Arc<dyn Any + Send + Sync>,
    core: Arc<GraphCore>,
}

/// Process-wide table of graphs, keyed by id and payload type.
///
/// Entries are only ever added, so concurrent lookups never observe a
/// graph disappearing.
#[derive(Default)]
pub struct GraphRegistry {
    graphs: DashMap<(String, TypeId), Registered>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the graph `graph_id` carrying `P`, creating it on first use.
    pub fn create_if_absent<P: Send + 'static>(&self, graph_id: &str) -> Arc<Graph<P>> {
        let key = (graph_id.to_string(), TypeId::of::<P>());
        if let Some(graph) = self
            .graphs
            .get(&key)
            .and_then(|entry| Arc::clone(&entry.graph).downcast::<Graph<P>>().ok())
        {
            return graph;
        }

        let entry = self.graphs.entry(key).or_insert_with(|| {
            info!(graph = graph_id, payload = type_name::<P>(), "graph created");
            let graph = Arc::new(Graph::<P>::new(graph_id));
            Registered {
                payload_name: type_name::<P>(),
                core: Arc::clone(graph.core()),
                graph,
            }
        });

        match Arc::clone(&entry.graph).downcast::<Graph<P>>() {
            Ok(graph) => graph,
            // The key includes TypeId::of::<P>(), so the stored graph is a Graph<P>.
            Err(_) => unreachable!("graph registered under a foreign payload type"),
        }
    }

    /// Returns the existing graph `graph_id` carrying `P`.
    pub fn graph<P: Send + 'static>(&self, graph_id: &str) -> Result<Arc<Graph<P>>, GraphError> {
        let key = (graph_id.to_string(), TypeId::of::<P>());
        if let Some(entry) = self.graphs.get(&key) {
            if let Ok(graph) = Arc::clone(&entry.graph).downcast::<Graph<P>>() {
                return Ok(graph);
            }
        }

        match self.graphs.iter().find(|entry| entry.key().0 == graph_id) {
            Some(other) => Err(GraphError::PayloadMismatch {
                graph: graph_id.to_string(),
                what: "graph".to_string(),
                expected: type_name::<P>(),
                found: other.payload_name,
            }),
            None => Err(GraphError::GraphNotFound {
                graph: graph_id.to_string(),
            }),
        }
    }

    /// Looks up node `node_id` of graph `graph_id`, whatever the graph's
    /// payload type, and returns its input if it accepts `I`.
    pub fn find_node<I: Send + 'static>(
        &self,
        graph_id: &str,
        node_id: &str,
    ) -> Result<Arc<dyn Sender<I>>, GraphError> {
        let cores: Vec<Arc<GraphCore>> = self
            .graphs
            .iter()
            .filter(|entry| entry.key().0 == graph_id)
            .map(|entry| Arc::clone(&entry.core))
            .collect();

        if cores.is_empty() {
            return Err(GraphError::GraphNotFound {
                graph: graph_id.to_string(),
            });
        }

        let mut last_err = None;
        for core in cores {
            match core.find::<I>(node_id) {
                Ok(sender) => return Ok(sender),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| GraphError::NodeNotFound {
            graph: graph_id.to_string(),
            node: node_id.to_string(),
        }))
    }

    /// Ids of every registered graph.
    pub fn graph_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.graphs.iter().map(|e| e.key().0.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
