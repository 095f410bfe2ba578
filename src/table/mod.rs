//! The metadata table.
//!
//! A single text file shared by every process using the cache directory:
//!
//! ```text
//! +-----------------------------------+
//! | record_count;dead_count;end_offset|  30 bytes, space padded
//! +-----------------------------------+
//! | # comment lines, kept verbatim    |
//! | state;hash;timestamp;file;...     |  append-only records
//! | ...                               |
//! +-----------------------------------+  <- end_offset
//! ```
//!
//! Records are never patched in place. A state change appends a new record
//! for the key and the latest record of a key is its current entry; a Dead
//! record is a tombstone. Compaction rewrites the record region to keep one
//! record per surviving key.
//!
//! All access goes through a [`LockedTable`], which holds an advisory lock on
//! the table handle for its lifetime.

pub mod compaction;
pub mod lock;
pub mod record;
pub mod stats;

pub use compaction::CompactionStats;
pub use lock::LockMode;
pub use stats::STATS_LEN;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::options::Options;
use crate::types::{CacheEntry, CacheStats, EntryState, RequestKey};
use crate::util::filename;

/// An open handle on the metadata table.
pub struct CacheTable {
    file: File,
    path: PathBuf,
    options: Arc<Options>,
}

impl CacheTable {
    /// Open the table read+write.
    ///
    /// Returns `Ok(None)` if the table does not exist and `create` is false.
    pub fn open(options: Arc<Options>, create: bool) -> Result<Option<Self>> {
        let path = options.table_path();

        if create {
            filename::create_dir_if_missing(&options.cache_dir)?;
        }

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !create => {
                debug!(path = %path.display(), "cache table does not exist");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Some(Self {
            file,
            path,
            options,
        }))
    }

    /// Lock the table.
    pub fn lock(&self, mode: LockMode) -> Result<LockedTable<'_>> {
        if mode == LockMode::Unlock {
            return Err(Error::internal("cannot acquire an unlock"));
        }
        let retries = lock::lock(&self.file, mode, &self.options)?;
        trace!(?mode, retries, "cache table locked");
        Ok(LockedTable {
            table: self,
            mode,
            retries,
            released: false,
        })
    }

    /// Path of the table file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Options the table was opened with.
    pub fn options(&self) -> &Options {
        &self.options
    }
}

/// A locked table. The lock is released by [`LockedTable::release`] or,
/// best-effort, on drop.
pub struct LockedTable<'a> {
    table: &'a CacheTable,
    mode: LockMode,
    retries: u32,
    released: bool,
}

impl<'a> LockedTable<'a> {
    /// The lock mode held.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Lock attempts beyond the first that acquisition needed.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Options the table was opened with.
    pub fn options(&self) -> &Options {
        &self.table.options
    }

    /// Cache directory holding the payload files.
    pub fn cache_dir(&self) -> &Path {
        &self.table.options.cache_dir
    }

    /// Read the stats header without compacting.
    ///
    /// An empty table reads as zero stats; under a write lock the zero header
    /// is also written out.
    pub fn load_stats(&self) -> Result<CacheStats> {
        let len = self.table.file.metadata()?.len();

        if len == 0 {
            let stats = CacheStats::empty(STATS_LEN as u64);
            if self.mode == LockMode::Write {
                debug!(path = %self.table.path.display(), "bootstrapping empty cache table");
                self.write_stats(&stats)?;
            }
            return Ok(stats);
        }

        if len < STATS_LEN as u64 {
            return Err(Error::corrupt_header(format!(
                "table is {} bytes, shorter than its header",
                len
            )));
        }

        let mut header = [0u8; STATS_LEN];
        let mut file = &self.table.file;
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;

        let mut stats = stats::parse(&header)?;
        if stats.end_offset == 0 {
            stats.end_offset = len;
        }
        if stats.end_offset < STATS_LEN as u64 || stats.end_offset > len {
            return Err(Error::corrupt_header(format!(
                "end offset {} outside table of {} bytes",
                stats.end_offset, len
            )));
        }

        Ok(stats)
    }

    /// Read the stats header, compacting first when the table needs it.
    ///
    /// Compaction only runs under a write lock, when the dead record count
    /// reached `max_dead_records`.
    pub fn read_stats(&self) -> Result<(CacheStats, Option<CompactionStats>)> {
        let stats = self.load_stats()?;
        if self.mode == LockMode::Write
            && stats.dead_count >= self.table.options.max_dead_records as u64
        {
            let (stats, compaction) = self.compact(&stats)?;
            return Ok((stats, Some(compaction)));
        }
        Ok((stats, None))
    }

    /// Read stats for an append. Besides the dead record trigger, compacts
    /// when the table holds `max_records` records or more.
    pub fn read_stats_for_append(&self) -> Result<(CacheStats, Option<CompactionStats>)> {
        let (stats, compaction) = self.read_stats()?;
        if compaction.is_none() && stats.record_count >= self.table.options.max_records as u64 {
            let (stats, compaction) = self.compact(&stats)?;
            return Ok((stats, Some(compaction)));
        }
        Ok((stats, compaction))
    }

    /// Rewrite the stats header.
    pub fn write_stats(&self, stats: &CacheStats) -> Result<()> {
        self.require_write("write stats")?;
        let line = stats::render(stats)?;
        self.write_at(0, &line)
    }

    /// Compact the table now.
    pub fn compact(&self, stats: &CacheStats) -> Result<(CacheStats, CompactionStats)> {
        self.require_write("compact")?;
        compaction::compact(self, stats)
    }

    /// The latest record of `key`, including a Dead one.
    pub fn current(&self, stats: &CacheStats, key: &RequestKey) -> Result<Option<CacheEntry>> {
        let region = self.read_region(stats)?;
        let hash = key.hash_key();
        let mut latest = None;

        for line in record::lines(&region, STATS_LEN as u64) {
            if line.is_comment() || line.is_blank() {
                continue;
            }
            match line.head() {
                Some((_, h)) if h == hash => {}
                _ => continue,
            }
            match line.parse() {
                Ok(entry) if entry.key == *key => latest = Some(entry),
                Ok(_) => {}
                Err(e) => trace!(error = %e, "skipping unreadable record"),
            }
        }

        Ok(latest)
    }

    /// The current entry of `key`; a Dead current record is no entry.
    pub fn find(&self, stats: &CacheStats, key: &RequestKey) -> Result<Option<CacheEntry>> {
        Ok(self.current(stats, key)?.filter(|e| !e.state.is_dead()))
    }

    /// Current non-dead entries, ordered by the position of their latest
    /// record.
    pub fn entries(&self, stats: &CacheStats) -> Result<Vec<CacheEntry>> {
        let region = self.read_region(stats)?;
        let mut latest: HashMap<RequestKey, CacheEntry> = HashMap::new();

        for line in record::lines(&region, STATS_LEN as u64) {
            if line.is_comment() || line.is_blank() {
                continue;
            }
            if let Ok(entry) = line.parse() {
                latest.insert(entry.key.clone(), entry);
            }
        }

        let mut entries: Vec<CacheEntry> = latest
            .into_values()
            .filter(|e| !e.state.is_dead())
            .collect();
        entries.sort_by_key(|e| e.file_position);
        Ok(entries)
    }

    /// Append a record at the end of the table and update the header.
    ///
    /// `supersedes` is the key's previous current record, if any. It becomes
    /// dead weight unless it already was a Dead record; a Dead record is dead
    /// weight itself.
    pub fn append(
        &self,
        stats: &CacheStats,
        entry: &CacheEntry,
        supersedes: Option<&CacheEntry>,
    ) -> Result<(CacheStats, CacheEntry)> {
        self.require_write("append")?;

        let line = record::encode(entry);
        self.write_at(stats.end_offset, line.as_bytes())?;

        let mut dead = 0;
        if supersedes.is_some_and(|prev| !prev.state.is_dead()) {
            dead += 1;
        }
        if entry.state == EntryState::Dead {
            dead += 1;
        }

        let updated = CacheStats {
            record_count: stats.record_count + 1,
            dead_count: stats.dead_count + dead,
            end_offset: stats.end_offset + line.len() as u64,
        };
        self.write_stats(&updated)?;

        let mut written = entry.clone();
        written.file_position = stats.end_offset;
        trace!(
            key = %entry.key,
            state = %entry.state,
            offset = written.file_position,
            "appended cache record"
        );
        Ok((updated, written))
    }

    /// Release the lock, reporting failure.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        lock::lock(&self.table.file, LockMode::Unlock, &self.table.options).map(|_| ())
    }

    pub(crate) fn read_region(&self, stats: &CacheStats) -> Result<Vec<u8>> {
        let len = stats.end_offset.saturating_sub(STATS_LEN as u64) as usize;
        let mut buf = vec![0u8; len];
        let mut file = &self.table.file;
        file.seek(SeekFrom::Start(STATS_LEN as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub(crate) fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = &self.table.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    pub(crate) fn truncate(&self, len: u64) -> Result<()> {
        self.table.file.set_len(len)?;
        self.table.file.sync_data()?;
        Ok(())
    }

    fn require_write(&self, what: &str) -> Result<()> {
        if self.mode != LockMode::Write {
            return Err(Error::internal(format!("{} requires a write lock", what)));
        }
        Ok(())
    }
}

impl Drop for LockedTable<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = lock::lock(&self.table.file, LockMode::Unlock, &self.table.options) {
                error!(error = %e, path = %self.table.path.display(), "failed to release cache table lock");
            }
        }
    }
}
