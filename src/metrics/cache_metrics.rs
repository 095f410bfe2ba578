//! Per-context cache metrics.

use std::fmt;

use super::collector::{Counter, Histogram};

/// Counters for one [`FileCache`](crate::FileCache).
///
/// These are process-local; other processes sharing the directory keep their
/// own.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Reads served from the cache.
    pub hits: Counter,
    /// Reads that found no usable entry.
    pub misses: Counter,
    /// Entries found invalid on read and marked Dead.
    pub stale_entries: Counter,
    /// Payload reads that failed after a successful lookup.
    pub read_failures: Counter,
    /// Entries created.
    pub writes: Counter,
    /// Writes skipped because the key already had an entry.
    pub writes_skipped: Counter,
    /// Payload bytes read.
    pub bytes_read: Counter,
    /// Payload bytes written.
    pub bytes_written: Counter,
    /// Compactions run.
    pub compactions: Counter,
    /// Entries evicted by compaction.
    pub evictions: Counter,
    /// Lock attempts that had to be retried.
    pub lock_retries: Counter,
    /// Operations that gave up waiting for the lock.
    pub lock_timeouts: Counter,
    /// Read latency (microseconds).
    pub read_latency: Histogram,
    /// Write latency (microseconds).
    pub write_latency: Histogram,
}

impl CacheMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the counters.
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            hits: self.hits.get(),
            misses: self.misses.get(),
            stale_entries: self.stale_entries.get(),
            read_failures: self.read_failures.get(),
            writes: self.writes.get(),
            writes_skipped: self.writes_skipped.get(),
            bytes_read: self.bytes_read.get(),
            bytes_written: self.bytes_written.get(),
            compactions: self.compactions.get(),
            evictions: self.evictions.get(),
            lock_retries: self.lock_retries.get(),
            lock_timeouts: self.lock_timeouts.get(),
            read_latency_mean_us: self.read_latency.mean(),
            write_latency_mean_us: self.write_latency.mean(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.stale_entries,
            &self.read_failures,
            &self.writes,
            &self.writes_skipped,
            &self.bytes_read,
            &self.bytes_written,
            &self.compactions,
            &self.evictions,
            &self.lock_retries,
            &self.lock_timeouts,
        ] {
            counter.reset();
        }
        self.read_latency.reset();
        self.write_latency.reset();
    }
}

/// Point-in-time copy of [`CacheMetrics`].
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub hits: u64,
    pub misses: u64,
    pub stale_entries: u64,
    pub read_failures: u64,
    pub writes: u64,
    pub writes_skipped: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub compactions: u64,
    pub evictions: u64,
    pub lock_retries: u64,
    pub lock_timeouts: u64,
    pub read_latency_mean_us: f64,
    pub write_latency_mean_us: f64,
}

impl MetricsSummary {
    /// Fraction of reads served from the cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Cache Metrics ===")?;
        writeln!(
            f,
            "Reads: {} hits, {} misses ({:.1}% hit rate), {} stale, {} failed",
            self.hits,
            self.misses,
            self.hit_rate() * 100.0,
            self.stale_entries,
            self.read_failures
        )?;
        writeln!(
            f,
            "Writes: {} stored, {} skipped",
            self.writes, self.writes_skipped
        )?;
        writeln!(
            f,
            "Bytes: {} read, {} written",
            self.bytes_read, self.bytes_written
        )?;
        writeln!(
            f,
            "Latency: read {:.1}us, write {:.1}us",
            self.read_latency_mean_us, self.write_latency_mean_us
        )?;
        writeln!(
            f,
            "Table: {} compactions, {} evictions",
            self.compactions, self.evictions
        )?;
        write!(
            f,
            "Locking: {} retries, {} timeouts",
            self.lock_retries, self.lock_timeouts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_and_hit_rate() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.summary().hit_rate(), 0.0);

        metrics.hits.add(3);
        metrics.misses.inc();
        metrics.compactions.inc();

        let summary = metrics.summary();
        assert_eq!(summary.hits, 3);
        assert!((summary.hit_rate() - 0.75).abs() < f64::EPSILON);

        let text = summary.to_string();
        assert!(text.contains("75.0% hit rate"));
        assert!(text.contains("1 compactions"));
    }

    #[test]
    fn test_reset() {
        let metrics = CacheMetrics::new();
        metrics.writes.inc();
        metrics.read_latency.observe(10);
        metrics.reset();

        let summary = metrics.summary();
        assert_eq!(summary.writes, 0);
        assert_eq!(summary.read_latency_mean_us, 0.0);
    }
}
