//! Cache metrics.
//!
//! Hit/miss counts, payload bytes, compaction and lock contention counters,
//! and read/write latency, all updated with relaxed atomics.

mod cache_metrics;
mod collector;

pub use cache_metrics::{CacheMetrics, MetricsSummary};
pub use collector::{Counter, Histogram, Timer};
