//! Service call metrics: the record produced per service and minute, and
//! the graphs that reduce it across the cluster and roll it up into hours
//! and days.

pub mod pipeline;
pub mod service;

pub use pipeline::{
    ServicePipeline, DAY_MODEL, HOUR_MODEL, MINUTE_MODEL, SERVICE_METRICS, SERVICE_METRICS_DAY,
    SERVICE_METRICS_DAY_REC, SERVICE_METRICS_HOUR, SERVICE_METRICS_HOUR_REC, SERVICE_METRICS_REC,
};
pub use service::{ServiceCall, ServiceCallTransform};
