//! Observability helpers

pub mod run_metrics;

pub use run_metrics::{CrewRunCount, RunMetrics, RunMetricsSnapshot};
