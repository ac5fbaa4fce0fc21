//! Directed pipelines of stages.
//!
//! A [`Graph`] carries one payload type from its single head node through a
//! tree of stages. Graphs are owned by a [`GraphRegistry`], which also lets
//! one graph's output be bridged into a node of another.

pub mod outlet;
pub mod registry;

use std::any::{type_name, Any, TypeId};
use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::worker::{AcceptError, Sender};

pub use outlet::{Outlet, Stage};
pub use registry::GraphRegistry;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("graph {graph} not found")]
    GraphNotFound { graph: String },

    #[error("graph {graph}: node {node} not found")]
    NodeNotFound { graph: String, node: String },

    #[error("graph {graph}: duplicate node {node}")]
    DuplicateNode { graph: String, node: String },

    #[error("graph {graph} already has a head node")]
    HeadExists { graph: String },

    #[error("graph {graph} has no head node")]
    NoHead { graph: String },

    #[error("graph {graph}: {what} carries {found}, not {expected}")]
    PayloadMismatch {
        graph: String,
        what: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error(transparent)]
    Accept(#[from] AcceptError),
}

/// Address of a node in some graph of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub graph_id: String,
    pub node_id: String,
}

impl NodeRef {
    pub fn new(graph_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            graph_id: graph_id.into(),
            node_id: node_id.into(),
        }
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.graph_id, self.node_id)
    }
}

/// Type-erased node, shared by every handle and lookup.
struct NodeEntry {
    input_type: TypeId,
    input_name: &'static str,
    /// Holds an `Arc<dyn Sender<I>>`.
    input: Box<dyn Any + Send + Sync>,
}

/// Untyped node table of one graph.
pub(crate) struct GraphCore {
    id: String,
    nodes: DashMap<String, NodeEntry>,
}

impl GraphCore {
    fn insert<I: Send + 'static>(
        &self,
        node_id: &str,
        input: Arc<dyn Sender<I>>,
    ) -> Result<(), GraphError> {
        match self.nodes.entry(node_id.to_string()) {
            Entry::Occupied(_) => Err(GraphError::DuplicateNode {
                graph: self.id.clone(),
                node: node_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(NodeEntry {
                    input_type: TypeId::of::<I>(),
                    input_name: type_name::<I>(),
                    input: Box::new(input),
                });
                Ok(())
            }
        }
    }

    pub(crate) fn find<I: Send + 'static>(
        &self,
        node_id: &str,
    ) -> Result<Arc<dyn Sender<I>>, GraphError> {
        let entry = self
            .nodes
            .get(node_id)
            .ok_or_else(|| GraphError::NodeNotFound {
                graph: self.id.clone(),
                node: node_id.to_string(),
            })?;

        let mismatch = || GraphError::PayloadMismatch {
            graph: self.id.clone(),
            what: format!("node {node_id}"),
            expected: type_name::<I>(),
            found: entry.input_name,
        };

        if entry.input_type != TypeId::of::<I>() {
            return Err(mismatch());
        }
        entry
            .input
            .downcast_ref::<Arc<dyn Sender<I>>>()
            .cloned()
            .ok_or_else(mismatch)
    }
}

/// A named pipeline whose head accepts `P`.
pub struct Graph<P> {
    core: Arc<GraphCore>,
    head: OnceLock<Arc<dyn Sender<P>>>,
}

impl<P: Send + 'static> Graph<P> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            core: Arc::new(GraphCore {
                id: id.into(),
                nodes: DashMap::new(),
            }),
            head: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub(crate) fn core(&self) -> &Arc<GraphCore> {
        &self.core
    }

    pub fn node_count(&self) -> usize {
        self.core.nodes.len()
    }

    /// Adds the head node. A graph has exactly one.
    pub fn add_node<O>(&self, node_id: &str, stage: Stage<P, O>) -> Result<NodeHandle<O>, GraphError>
    where
        O: Clone + Send + 'static,
    {
        if self.head.get().is_some() {
            return Err(GraphError::HeadExists {
                graph: self.core.id.clone(),
            });
        }
        self.core.insert(node_id, Arc::clone(&stage.input))?;
        if self.head.set(stage.input).is_err() {
            self.core.nodes.remove(node_id);
            return Err(GraphError::HeadExists {
                graph: self.core.id.clone(),
            });
        }

        debug!(graph = %self.core.id, node = node_id, "head node added");

        Ok(NodeHandle {
            core: Arc::clone(&self.core),
            node_id: node_id.to_string(),
            outlet: stage.outlet,
        })
    }

    /// Injects `msg` at the head node.
    pub async fn start(&self, msg: P) -> Result<(), GraphError> {
        let head = self.head.get().ok_or_else(|| GraphError::NoHead {
            graph: self.core.id.clone(),
        })?;
        head.accept(msg).await?;
        Ok(())
    }

    /// Looks up a node's input sender by id.
    pub fn find_node<I: Send + 'static>(&self, node_id: &str) -> Result<Arc<dyn Sender<I>>, GraphError> {
        self.core.find(node_id)
    }
}

/// Handle to a node, used to attach what comes after it.
pub struct NodeHandle<O> {
    core: Arc<GraphCore>,
    node_id: String,
    outlet: Outlet<O>,
}

impl<O: Clone + Send + 'static> NodeHandle<O> {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn graph_id(&self) -> &str {
        &self.core.id
    }

    /// Adds a new node fed by this node's output.
    pub fn add_next<N>(&self, node_id: &str, stage: Stage<O, N>) -> Result<NodeHandle<N>, GraphError>
    where
        N: Clone + Send + 'static,
    {
        self.core.insert(node_id, Arc::clone(&stage.input))?;
        self.outlet.connect(stage.input);

        debug!(
            graph = %self.core.id,
            from = %self.node_id,
            node = node_id,
            "node added",
        );

        Ok(NodeHandle {
            core: Arc::clone(&self.core),
            node_id: node_id.to_string(),
            outlet: stage.outlet,
        })
    }

    /// Feeds this node's output into `target`, typically a node looked up
    /// in another graph.
    pub fn bridge(&self, target: Arc<dyn Sender<O>>) {
        debug!(
            graph = %self.core.id,
            from = %self.node_id,
            target = target.name(),
            "bridge added",
        );
        self.outlet.connect(target);
    }
}
