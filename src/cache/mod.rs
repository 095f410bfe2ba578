//! FileCache - the cache context.
//!
//! A [`FileCache`] is opened once per process (or session) and passed by
//! reference to every operation. It owns the configuration and the metrics;
//! the table file is opened afresh by each operation so that its advisory
//! lock also excludes other threads of the same process.
//!
//! # Protocol
//!
//! Writes are two-phase: the payload is written and renamed into place
//! first, then the metadata record is committed under the exclusive table
//! lock, after re-checking that the key still has no entry.
//!
//! Reads validate and check out the entry in one exclusive section, read the
//! payload without holding the table lock, then check the entry back in.
//! A checkout protects the payload from compaction until it is checked in
//! or its grace period (`max_lock_time`) runs out.

mod reader;
mod writer;

pub use writer::WriteOutcome;

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics::CacheMetrics;
use crate::options::Options;
use crate::payload::{PayloadCodec, RawCodec};
use crate::table::{CacheTable, CompactionStats, LockMode, LockedTable};
use crate::types::{CacheEntry, CacheStats, EntryState, RequestKey};
use crate::util::filename;

/// Shared on-disk cache of remote data requests.
///
/// Thread-safe; share it by reference or through an `Arc`.
pub struct FileCache {
    /// Cache configuration.
    options: Arc<Options>,
    /// Process-local counters.
    metrics: CacheMetrics,
}

impl FileCache {
    /// Open the cache described by `options`.
    ///
    /// Creates the directory and table when `create_if_missing` is set,
    /// bootstraps the table header, and removes temporary payload files
    /// abandoned by crashed writers.
    pub fn open(options: Options) -> Result<Self> {
        options.validate()?;
        let options = Arc::new(options);

        let table = CacheTable::open(options.clone(), options.create_if_missing)?
            .ok_or_else(|| Error::NotFound(options.table_path().display().to_string()))?;
        {
            let locked = table.lock(LockMode::Write)?;
            let (stats, _) = locked.read_stats()?;
            debug!(
                path = %table.path().display(),
                records = stats.record_count,
                dead = stats.dead_count,
                "opened file cache"
            );
            locked.release()?;
        }

        match filename::remove_stale_temp_files(&options.cache_dir, options.max_lock_time) {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "removed stale temporary payload files"),
            Err(e) => warn!(error = %e, "failed to sweep temporary payload files"),
        }

        Ok(Self {
            options,
            metrics: CacheMetrics::new(),
        })
    }

    /// Open the cache configured by `UDA_CACHE_DIR` and `UDA_CACHE_TABLE`.
    ///
    /// Returns `Ok(None)` when either variable is unset: the cache is then
    /// simply not in use.
    pub fn from_env() -> Result<Option<Self>> {
        match Options::from_env()? {
            Some(options) => Self::open(options).map(Some),
            None => {
                debug!("file cache not configured, caching disabled");
                Ok(None)
            }
        }
    }

    /// Read the payload cached for `key`. A miss is `Ok(None)`.
    pub fn read(&self, key: &RequestKey) -> Result<Option<Bytes>> {
        self.read_with(&RawCodec, key)
    }

    /// Read and decode the value cached for `key`.
    pub fn read_with<C: PayloadCodec>(&self, codec: &C, key: &RequestKey) -> Result<Option<C::Value>> {
        reader::read(self, codec, key)
    }

    /// Cache `payload` for `key`.
    ///
    /// Does nothing if the key already has an entry, whatever its validity.
    pub fn write(&self, key: &RequestKey, payload: impl Into<Bytes>) -> Result<WriteOutcome> {
        let payload: Bytes = payload.into();
        self.write_with(&RawCodec, key, &payload)
    }

    /// Encode and cache `value` for `key`.
    pub fn write_with<C: PayloadCodec>(
        &self,
        codec: &C,
        key: &RequestKey,
        value: &C::Value,
    ) -> Result<WriteOutcome> {
        writer::write(self, codec, key, value)
    }

    /// Look up the current entry of `key` without changing anything.
    pub fn find(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
        let table = self.open_table()?;
        let locked = self.lock(&table, LockMode::Read)?;
        let stats = locked.load_stats()?;
        let entry = locked.find(&stats, key)?;
        locked.release()?;
        Ok(entry)
    }

    /// Current table header.
    pub fn stats(&self) -> Result<CacheStats> {
        let table = self.open_table()?;
        let locked = self.lock(&table, LockMode::Read)?;
        let stats = locked.load_stats()?;
        locked.release()?;
        Ok(stats)
    }

    /// All current entries.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let table = self.open_table()?;
        let locked = self.lock(&table, LockMode::Read)?;
        let stats = locked.load_stats()?;
        let entries = locked.entries(&stats)?;
        locked.release()?;
        Ok(entries)
    }

    /// Compact the table now.
    pub fn compact(&self) -> Result<CompactionStats> {
        let table = self.open_table()?;
        let locked = self.lock(&table, LockMode::Write)?;
        let stats = locked.load_stats()?;
        let (_, result) = locked.compact(&stats)?;
        locked.release()?;
        self.record_compaction(Some(&result));
        Ok(result)
    }

    /// Mark the entry of `key` Dead. Returns whether there was one.
    pub fn invalidate(&self, key: &RequestKey) -> Result<bool> {
        let table = self.open_table()?;
        let locked = self.lock(&table, LockMode::Write)?;
        let (stats, compaction) = locked.read_stats()?;
        self.record_compaction(compaction.as_ref());

        let invalidated = match locked.find(&stats, key)? {
            Some(entry) => {
                let dead = entry.with_state(EntryState::Dead, entry.timestamp);
                locked.append(&stats, &dead, Some(&entry))?;
                debug!(key = %key, "invalidated cache entry");
                true
            }
            None => false,
        };
        locked.release()?;
        Ok(invalidated)
    }

    /// Process-local metrics.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Cache configuration.
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn open_table(&self) -> Result<CacheTable> {
        CacheTable::open(self.options.clone(), self.options.create_if_missing)?
            .ok_or_else(|| Error::NotFound(self.options.table_path().display().to_string()))
    }

    pub(crate) fn lock<'t>(&self, table: &'t CacheTable, mode: LockMode) -> Result<LockedTable<'t>> {
        match table.lock(mode) {
            Ok(locked) => {
                self.metrics.lock_retries.add(u64::from(locked.retries()));
                Ok(locked)
            }
            Err(e) => {
                if let Error::LockTimeout { attempts } = &e {
                    self.metrics.lock_timeouts.inc();
                    warn!(?mode, attempts, "gave up waiting for the cache table lock");
                }
                Err(e)
            }
        }
    }

    pub(crate) fn record_compaction(&self, compaction: Option<&CompactionStats>) {
        if let Some(result) = compaction {
            self.metrics.compactions.inc();
            self.metrics.evictions.add(result.entries_evicted);
        }
    }
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("table", &self.options.table_path())
            .finish()
    }
}
