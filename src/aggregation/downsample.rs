use std::sync::Arc;

use prometheus::Counter;

use crate::graph::Stage;
use crate::record::{downsample, KeyedRecord, Step};
use crate::worker::{AcceptError, AcceptFuture, Sender, WorkerContext, WorkerError, WorkerPool};

use super::{spawn_stage, AggregationSettings, MergeRecords, Transform, TransformError};

/// Moves a finer-grained record into the coarser bucket `step`.
///
/// Columns are carried over as they are, so merging the outputs of one
/// hour's minute records yields that hour's totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Downsample {
    pub step: Step,
}

impl Downsample {
    pub fn new(step: Step) -> Self {
        Self { step }
    }
}

impl Transform for Downsample {
    type Input = KeyedRecord;

    fn transform(&self, input: KeyedRecord) -> Result<KeyedRecord, TransformError> {
        let bucket = downsample(input.time_bucket(), self.step)?;
        Ok(input.rebucket(bucket))
    }
}

/// Input of a downsampling stage. Records are moved into the coarser bucket
/// before routing, so every record of one target bucket reaches the same
/// instance and is reduced there.
struct Rebucket {
    name: String,
    downsample: Downsample,
    pool: Arc<WorkerPool<KeyedRecord>>,
    dropped: Counter,
}

impl Sender<KeyedRecord> for Rebucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&self, msg: KeyedRecord) -> AcceptFuture<'_> {
        Box::pin(async move {
            match self.downsample.transform(msg) {
                Ok(record) => self.pool.accept(record).await,
                Err(e) => {
                    self.dropped.inc();
                    Err(AcceptError::Unroutable {
                        worker: self.name.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        })
    }
}

/// Spawns a pool that reduces records re-bucketed to `step` and returns it
/// with its graph stage.
pub fn spawn_downsample_stage(
    settings: AggregationSettings,
    step: Step,
    ctx: &WorkerContext,
) -> Result<(Arc<WorkerPool<KeyedRecord>>, Stage<KeyedRecord, KeyedRecord>), WorkerError> {
    let dropped = ctx
        .health
        .messages_dropped
        .with_label_values(&[settings.role.name.as_str(), "transform"]);
    let name = settings.role.name.clone();
    let (pool, stage) = spawn_stage(settings, MergeRecords, ctx)?;

    let input: Arc<dyn Sender<KeyedRecord>> = Arc::new(Rebucket {
        name,
        downsample: Downsample::new(step),
        pool: Arc::clone(&pool),
        dropped,
    });
    Ok((pool, Stage::new(input, stage.outlet)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::aggregation::FlushMode;
    use crate::export::health::HealthMetrics;
    use crate::graph::tests::Capture;
    use crate::graph::GraphRegistry;
    use crate::record::{BucketError, Column, Value};
    use crate::worker::{QueueConfig, Role, SelectionStrategy};

    fn context() -> WorkerContext {
        WorkerContext {
            registry: Arc::new(GraphRegistry::new()),
            health: Arc::new(HealthMetrics::new("127.0.0.1:0").unwrap()),
            cancel: CancellationToken::new(),
        }
    }

    fn settings() -> AggregationSettings {
        AggregationSettings {
            role: Role::new("hour_downsample", SelectionStrategy::Affinity),
            size: 4,
            queue: QueueConfig::internal(),
            mode: FlushMode::Cadence,
            flush_interval: Duration::from_secs(1),
            providers: Vec::new(),
        }
    }

    fn minute(bucket: i64, calls: i64) -> KeyedRecord {
        KeyedRecord::new("svcA", bucket).with_column(Column::sum("calls", Value::Long(calls)))
    }

    #[test]
    fn test_minute_to_hour() {
        let hour = Downsample::new(Step::Hour)
            .transform(minute(202403050709, 3))
            .unwrap();
        assert_eq!(hour.id(), "2024030507_svcA");
        assert_eq!(hour.long("calls"), Some(3));
    }

    #[test]
    fn test_minutes_of_one_hour_collide() {
        let t = Downsample::new(Step::Hour);
        let mut a = t.transform(minute(202403050701, 1)).unwrap();
        let b = t.transform(minute(202403050759, 2)).unwrap();
        a.merge(&b).unwrap();
        assert_eq!(a.long("calls"), Some(3));
    }

    #[test]
    fn test_rejects_finer_target() {
        let err = Downsample::new(Step::Minute)
            .transform(minute(2024030507, 1))
            .unwrap_err();
        assert!(matches!(
            err,
            TransformError::Bucket(BucketError::Finer { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_reduces_minutes_of_one_hour_on_one_instance() {
        let ctx = context();
        let (pool, stage) = spawn_downsample_stage(settings(), Step::Hour, &ctx).unwrap();
        let capture = Capture::<KeyedRecord>::new("sink");
        stage.outlet.connect(capture.clone());

        for m in 0..30 {
            stage.input.accept(minute(202403050700 + m, 1)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;

        {
            let seen = capture.seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].id(), "2024030507_svcA");
            assert_eq!(seen[0].long("calls"), Some(30));
        }

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_stage_refuses_finer_records() {
        let ctx = context();
        let (pool, stage) = spawn_downsample_stage(settings(), Step::Hour, &ctx).unwrap();

        let err = stage.input.accept(minute(20240305, 1)).await.unwrap_err();
        assert!(matches!(err, AcceptError::Unroutable { .. }));
        assert_eq!(
            ctx.health
                .messages_dropped
                .with_label_values(&["hour_downsample", "transform"])
                .get(),
            1.0
        );

        pool.shutdown().await;
    }
}
