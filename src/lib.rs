//! Streaming aggregation and worker-graph core of an APM analysis backend.

pub mod aggregation;
pub mod analysis;
pub mod config;
pub mod export;
pub mod graph;
pub mod node;
pub mod persistence;
pub mod record;
pub mod remote;
pub mod worker;
