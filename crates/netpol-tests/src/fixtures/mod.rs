//! Fixtures for corroborating probe results from Felix metrics and logs.

pub mod logs;
pub mod metrics;

pub use logs::FelixLogs;
pub use metrics::MetricsScraper;
