//! Worker primitives: the worker trait, bounded mailboxes, instance
//! selection and the pools that tie them together.

pub mod pool;
pub mod queue;
pub mod selector;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::export::health::HealthMetrics;
use crate::graph::GraphRegistry;

pub use pool::WorkerPool;
pub use queue::{OverflowPolicy, Pushed, QueueConfig, QueueError, WorkQueue};
pub use selector::{stable_hash, SelectionStrategy, Selector};

/// Messages that can be routed by key.
pub trait RoutingKey {
    fn routing_key(&self) -> &str;
}

/// Boxed future returned by [`Sender::accept`].
pub type AcceptFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AcceptError>> + Send + 'a>>;

/// Anything that accepts messages of type `M`: a worker pool, the remote
/// dispatcher, or a test capture.
pub trait Sender<M>: Send + Sync {
    /// Returns the name used in logs and metrics.
    fn name(&self) -> &str;

    /// Hands `msg` over. May wait when the receiver applies backpressure.
    fn accept(&self, msg: M) -> AcceptFuture<'_>;
}

/// A message handler owned by exactly one pool task.
///
/// All hooks run on that task, so implementations keep plain owned state
/// and never lock.
pub trait Worker<M>: Send + 'static {
    /// Resolves downstream references once, before the first message.
    fn pre_start(&mut self, registry: &GraphRegistry) -> Result<(), WorkerError> {
        let _ = registry;
        Ok(())
    }

    /// Handles one message.
    fn on_message(&mut self, msg: M) -> impl Future<Output = ()> + Send;

    /// Called on every pool tick, when the pool has a tick interval.
    fn on_tick(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called once after the mailbox is drained at shutdown.
    fn on_stop(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Names a worker kind at one pipeline stage and fixes how messages are
/// spread over its instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub selector: SelectionStrategy,
}

impl Role {
    pub fn new(name: impl Into<String>, selector: SelectionStrategy) -> Self {
        Self {
            name: name.into(),
            selector,
        }
    }
}

/// Shared handles every pool needs at construction.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<GraphRegistry>,
    pub health: Arc<HealthMetrics>,
    pub cancel: CancellationToken,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker {worker}: provider {provider} not found")]
    ProviderNotFound { worker: String, provider: String },

    #[error("worker pool must have at least one instance")]
    EmptyPool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcceptError {
    #[error("{worker}: mailbox full, message rejected")]
    Rejected { worker: String },

    #[error("{worker}: stopped")]
    Closed { worker: String },

    #[error("{worker}: cannot route message: {reason}")]
    Unroutable { worker: String, reason: String },

    #[error("{worker}: no instance for index {index}")]
    NoInstance { worker: String, index: usize },
}
