use std::convert::Infallible;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::worker::Sender;

/// Fan-out port a stage emits through.
///
/// Every connected target receives its own copy of each message. Delivery
/// order across targets is unspecified. A failing target is logged and
/// does not affect the others.
pub struct Outlet<O> {
    targets: Arc<RwLock<Vec<Arc<dyn Sender<O>>>>>,
}

impl<O> Clone for Outlet<O> {
    fn clone(&self) -> Self {
        Self {
            targets: Arc::clone(&self.targets),
        }
    }
}

impl<O> Default for Outlet<O> {
    fn default() -> Self {
        Self {
            targets: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl<O: Clone + Send + 'static> Outlet<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a downstream target.
    pub fn connect(&self, target: Arc<dyn Sender<O>>) {
        self.targets.write().push(target);
    }

    pub fn target_count(&self) -> usize {
        self.targets.read().len()
    }

    /// Sends `msg` to every target. Returns the number of targets that
    /// accepted it.
    pub async fn emit(&self, msg: O) -> usize {
        let targets: Vec<Arc<dyn Sender<O>>> = self.targets.read().clone();
        let Some((last, rest)) = targets.split_last() else {
            return 0;
        };

        let mut delivered = 0;
        for target in rest {
            if deliver(target.as_ref(), msg.clone()).await {
                delivered += 1;
            }
        }
        if deliver(last.as_ref(), msg).await {
            delivered += 1;
        }
        delivered
    }
}

async fn deliver<O>(target: &dyn Sender<O>, msg: O) -> bool {
    match target.accept(msg).await {
        Ok(()) => true,
        Err(e) => {
            warn!(target = target.name(), error = %e, "emission failed");
            false
        }
    }
}

/// A graph node: the sender that receives `I` plus the outlet its worker
/// emits `O` through.
pub struct Stage<I, O> {
    pub input: Arc<dyn Sender<I>>,
    pub outlet: Outlet<O>,
}

impl<I, O> Stage<I, O> {
    pub fn new(input: Arc<dyn Sender<I>>, outlet: Outlet<O>) -> Self {
        Self { input, outlet }
    }
}

impl<I> Stage<I, Infallible> {
    /// A stage with no output, such as a persistence worker.
    pub fn terminal(input: Arc<dyn Sender<I>>) -> Self {
        Self {
            input,
            outlet: Outlet::default(),
        }
    }
}
