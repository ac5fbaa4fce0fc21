use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::{Counter, Gauge};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{Pushed, QueueConfig, QueueError, WorkQueue};
use super::selector::Selector;
use super::{AcceptError, AcceptFuture, Role, RoutingKey, Sender, Worker, WorkerContext, WorkerError};

/// Per-role metric handles, resolved once at spawn.
#[derive(Clone)]
struct PoolMetrics {
    received: Counter,
    depth: Gauge,
    rejected: Counter,
    evicted: Counter,
}

/// A fixed set of worker instances, one tokio task and one mailbox each.
///
/// Messages are routed to an instance by the role's selection strategy
/// applied to the message's routing key.
pub struct WorkerPool<M> {
    role: Role,
    selector: Selector,
    queues: Vec<Arc<WorkQueue<M>>>,
    metrics: PoolMetrics,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<M: Send + 'static> WorkerPool<M> {
    /// Builds `size` workers with `factory`, runs their `pre_start` hooks
    /// and spawns one task per instance.
    ///
    /// If any `pre_start` fails nothing is spawned and the error is returned.
    pub fn spawn<W, F>(
        role: Role,
        size: usize,
        queue: QueueConfig,
        tick: Option<Duration>,
        ctx: &WorkerContext,
        mut factory: F,
    ) -> Result<Self, WorkerError>
    where
        W: Worker<M>,
        F: FnMut(usize) -> W,
    {
        let selector = Selector::new(role.selector, size)?;

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let mut worker = factory(index);
            worker.pre_start(&ctx.registry)?;
            workers.push(worker);
        }

        let health = &ctx.health;
        let metrics = PoolMetrics {
            received: health.messages_received.with_label_values(&[role.name.as_str()]),
            depth: health.queue_depth.with_label_values(&[role.name.as_str()]),
            rejected: health.queue_rejected.with_label_values(&[role.name.as_str()]),
            evicted: health.queue_evicted.with_label_values(&[role.name.as_str()]),
        };
        health
            .queue_capacity
            .with_label_values(&[role.name.as_str()])
            .set((queue.capacity * size) as f64);

        let cancel = ctx.cancel.child_token();
        let mut queues = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);
        for (index, worker) in workers.into_iter().enumerate() {
            let mailbox = Arc::new(WorkQueue::new(queue));
            queues.push(Arc::clone(&mailbox));
            handles.push(tokio::spawn(run_instance(
                worker,
                mailbox,
                tick,
                cancel.clone(),
                metrics.depth.clone(),
                format!("{}#{index}", role.name),
            )));
        }

        info!(
            role = %role.name,
            size,
            selector = role.selector.as_str(),
            capacity = queue.capacity,
            overflow = queue.overflow.as_str(),
            "worker pool started",
        );

        Ok(Self {
            role,
            selector,
            queues,
            metrics,
            cancel,
            handles: Mutex::new(handles),
        })
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn size(&self) -> usize {
        self.queues.len()
    }

    /// Total number of queued messages across instances.
    pub fn queued(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Enqueues `msg` on the instance at `index`.
    pub async fn dispatch(&self, index: usize, msg: M) -> Result<(), AcceptError> {
        let queue = self.queues.get(index).ok_or_else(|| AcceptError::NoInstance {
            worker: self.role.name.clone(),
            index,
        })?;

        match queue.push(msg).await {
            Ok(Pushed::Enqueued) => {
                self.metrics.received.inc();
                self.metrics.depth.inc();
                Ok(())
            }
            Ok(Pushed::EvictedOldest) => {
                self.metrics.received.inc();
                self.metrics.evicted.inc();
                Ok(())
            }
            Err(QueueError::Full) => {
                self.metrics.rejected.inc();
                Err(AcceptError::Rejected {
                    worker: self.role.name.clone(),
                })
            }
            Err(QueueError::Closed) => Err(AcceptError::Closed {
                worker: self.role.name.clone(),
            }),
        }
    }

    /// Signals every instance to drain its mailbox and stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for every instance task to finish.
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(role = %self.role.name, error = %e, "worker task join failed");
            }
        }
    }

    /// Stops the pool and waits until all instances have drained.
    pub async fn shutdown(&self) {
        self.stop();
        self.join().await;
        info!(role = %self.role.name, "worker pool stopped");
    }
}

impl<M: RoutingKey + Send + 'static> Sender<M> for WorkerPool<M> {
    fn name(&self) -> &str {
        &self.role.name
    }

    fn accept(&self, msg: M) -> AcceptFuture<'_> {
        Box::pin(async move {
            let index = self.selector.select(msg.routing_key());
            self.dispatch(index, msg).await
        })
    }
}

async fn run_instance<M, W>(
    mut worker: W,
    mailbox: Arc<WorkQueue<M>>,
    tick: Option<Duration>,
    cancel: CancellationToken,
    depth: Gauge,
    name: String,
) where
    M: Send + 'static,
    W: Worker<M>,
{
    let mut ticker = tick.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    // A due tick is taken before the next message, so a busy mailbox
    // cannot hold off flushes.
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = next_tick(&mut ticker) => worker.on_tick().await,
            msg = mailbox.pop() => match msg {
                Some(msg) => {
                    depth.dec();
                    worker.on_message(msg).await;
                }
                None => break,
            },
        }
    }

    mailbox.close();
    let mut drained = 0usize;
    while let Some(msg) = mailbox.try_pop() {
        depth.dec();
        worker.on_message(msg).await;
        drained += 1;
    }
    worker.on_stop().await;

    debug!(worker = %name, drained, "worker instance stopped");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
