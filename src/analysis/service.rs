use serde::{Deserialize, Serialize};

use crate::aggregation::{Transform, TransformError};
use crate::record::{time_bucket, Column, KeyedRecord, Step, Value};
use crate::worker::RoutingKey;

/// One observed call to a service, as handed over by ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub service: String,
    /// Call start, Unix milliseconds.
    pub timestamp_ms: i64,
    pub latency_ms: i64,
    pub is_error: bool,
}

impl ServiceCall {
    pub fn new(service: impl Into<String>, timestamp_ms: i64, latency_ms: i64, is_error: bool) -> Self {
        Self {
            service: service.into(),
            timestamp_ms,
            latency_ms,
            is_error,
        }
    }
}

impl RoutingKey for ServiceCall {
    fn routing_key(&self) -> &str {
        &self.service
    }
}

/// Turns a call into a per-minute service record.
///
/// Columns: `service` (non-mergeable), `calls`, `errors` and `latency_sum`
/// (summed longs), `last_status` (newest wins).
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceCallTransform;

impl Transform for ServiceCallTransform {
    type Input = ServiceCall;

    fn transform(&self, call: ServiceCall) -> Result<KeyedRecord, TransformError> {
        if call.service.is_empty() {
            return Err(TransformError::Invalid("empty service name".to_string()));
        }
        if call.latency_ms < 0 {
            return Err(TransformError::Invalid(format!(
                "negative latency {}ms for {}",
                call.latency_ms, call.service
            )));
        }

        let bucket = time_bucket(call.timestamp_ms, Step::Minute)?;
        let status = if call.is_error { "error" } else { "ok" };

        Ok(KeyedRecord::new(call.service.clone(), bucket)
            .with_last_update(call.timestamp_ms)
            .with_column(Column::non_mergeable("service", Value::String(call.service)))
            .with_column(Column::sum("calls", Value::Long(1)))
            .with_column(Column::sum("errors", Value::Long(i64::from(call.is_error))))
            .with_column(Column::sum("latency_sum", Value::Long(call.latency_ms)))
            .with_column(Column::cover("last_status", Value::String(status.to_string()))))
    }
}
