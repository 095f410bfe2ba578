//! Table compaction.
//!
//! Rewrites the record region so that:
//! - comment lines are kept verbatim, ahead of all records;
//! - each key keeps only its latest record, and keys whose latest record is
//!   Dead disappear;
//! - survivors are ordered by timestamp, ties by insertion order, and the
//!   oldest beyond `max_records` are evicted, except entries in an unexpired
//!   checkout.
//!
//! Payload files no longer referenced by a surviving record are deleted
//! after the table has been rewritten.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{CacheEntry, CacheStats};
use crate::util::{filename, unix_now};

use super::record::{self, RawLine};
use super::{LockedTable, STATS_LEN};

/// Statistics from a compaction.
#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    /// Records read from the table.
    pub records_read: u64,
    /// Records written back.
    pub records_kept: u64,
    /// Superseded records and tombstoned keys dropped.
    pub records_dropped: u64,
    /// Live entries evicted to respect `max_records`.
    pub entries_evicted: u64,
    /// Unreadable lines dropped.
    pub corrupt_records: u64,
    /// Comment lines carried over.
    pub comments_kept: u64,
    /// Payload files deleted.
    pub files_deleted: u64,
    /// Time taken in milliseconds.
    pub elapsed_ms: u64,
}

pub(super) fn compact(
    table: &LockedTable<'_>,
    stats: &CacheStats,
) -> Result<(CacheStats, CompactionStats)> {
    let start = Instant::now();
    let options = table.options();
    let mut result = CompactionStats::default();

    let region = table.read_region(stats)?;
    let mut comments: Vec<RawLine<'_>> = Vec::new();
    let mut records: Vec<CacheEntry> = Vec::new();

    for line in record::lines(&region, STATS_LEN as u64) {
        if line.is_comment() {
            comments.push(line);
            continue;
        }
        if line.is_blank() {
            continue;
        }
        match line.parse() {
            Ok(entry) => records.push(entry),
            Err(e) => {
                warn!(error = %e, "dropping unreadable cache record");
                result.corrupt_records += 1;
            }
        }
    }
    result.records_read = records.len() as u64;

    let mut latest: HashMap<&crate::types::RequestKey, usize> = HashMap::new();
    // Every write reserves a fresh payload name, so the first record naming a
    // file is the insertion of that entry. State records reuse the name.
    let mut inserted: HashMap<&str, usize> = HashMap::new();
    for (i, entry) in records.iter().enumerate() {
        latest.insert(&entry.key, i);
        inserted.entry(entry.filename.as_str()).or_insert(i);
    }

    let mut survivors: Vec<&CacheEntry> = Vec::new();
    let mut dropped: Vec<&CacheEntry> = Vec::new();
    for (i, entry) in records.iter().enumerate() {
        if latest.get(&entry.key) == Some(&i) && !entry.state.is_dead() {
            survivors.push(entry);
        } else {
            dropped.push(entry);
        }
    }
    result.records_dropped = dropped.len() as u64;

    survivors.sort_by_key(|e| (e.timestamp, inserted[e.filename.as_str()]));

    if survivors.len() > options.max_records {
        let now = unix_now();
        let lock_secs = options.max_lock_time.as_secs();
        let mut excess = survivors.len() - options.max_records;
        let mut kept = Vec::with_capacity(options.max_records);

        for entry in survivors {
            if excess > 0 && !entry.is_checked_out_at(now, lock_secs) {
                excess -= 1;
                result.entries_evicted += 1;
                dropped.push(entry);
            } else {
                kept.push(entry);
            }
        }
        survivors = kept;
    }

    let mut out = Vec::with_capacity(region.len());
    for line in &comments {
        out.extend_from_slice(line.bytes);
        out.push(b'\n');
    }
    for entry in &survivors {
        out.extend_from_slice(record::encode(entry).as_bytes());
    }

    let end = STATS_LEN as u64 + out.len() as u64;
    table.write_at(STATS_LEN as u64, &out)?;
    table.truncate(end)?;

    let compacted = CacheStats {
        record_count: survivors.len() as u64,
        dead_count: 0,
        end_offset: end,
    };
    table.write_stats(&compacted)?;

    let referenced: HashSet<&str> = survivors.iter().map(|e| e.filename.as_str()).collect();
    let mut seen = HashSet::new();
    for entry in dropped {
        let name = entry.filename.as_str();
        if referenced.contains(name) || !seen.insert(name) {
            continue;
        }
        let Some(path) = filename::resolve_in_dir(table.cache_dir(), name) else {
            warn!(file = name, "refusing to delete payload outside the cache directory");
            continue;
        };
        match filename::delete_file(&path) {
            Ok(()) => result.files_deleted += 1,
            Err(e) => warn!(error = %e, path = %path.display(), "failed to delete payload file"),
        }
    }

    result.records_kept = compacted.record_count;
    result.comments_kept = comments.len() as u64;
    result.elapsed_ms = start.elapsed().as_millis() as u64;

    debug!(
        read = result.records_read,
        kept = result.records_kept,
        dropped = result.records_dropped,
        evicted = result.entries_evicted,
        files_deleted = result.files_deleted,
        elapsed_ms = result.elapsed_ms,
        "compacted cache table"
    );

    Ok((compacted, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::table::{CacheTable, LockMode};
    use crate::types::{EntryState, RequestKey};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    fn setup(max_records: usize) -> (TempDir, CacheTable) {
        let dir = tempdir().unwrap();
        let options = Options {
            cache_dir: dir.path().to_path_buf(),
            max_records,
            ..Options::default()
        };
        let table = CacheTable::open(Arc::new(options), true).unwrap().unwrap();
        (dir, table)
    }

    fn entry(dir: &TempDir, source: &str, timestamp: u64) -> CacheEntry {
        let name = format!("udac_{}.cache", source);
        std::fs::write(dir.path().join(&name), source).unwrap();
        CacheEntry::new(RequestKey::new("SIG", source).unwrap(), name, timestamp)
    }

    #[test]
    fn test_compact_drops_dead_and_superseded() {
        let (dir, table) = setup(100);
        let locked = table.lock(LockMode::Write).unwrap();
        let (mut stats, _) = locked.read_stats().unwrap();

        let a = entry(&dir, "a", 0);
        let b = entry(&dir, "b", 0);
        let (s, a) = locked.append(&stats, &a, None).unwrap();
        stats = s;
        let (s, b) = locked.append(&stats, &b, None).unwrap();
        stats = s;

        let a_locked = a.with_state(EntryState::Locked, unix_now());
        let (s, a_locked) = locked.append(&stats, &a_locked, Some(&a)).unwrap();
        stats = s;
        let (s, _) = locked
            .append(&stats, &a_locked.with_state(EntryState::Live, 0), Some(&a_locked))
            .unwrap();
        stats = s;
        let (s, _) = locked
            .append(&stats, &b.with_state(EntryState::Dead, 0), Some(&b))
            .unwrap();
        stats = s;
        assert_eq!(stats.record_count, 5);
        assert_eq!(stats.dead_count, 4);

        let (stats, result) = locked.compact(&stats).unwrap();
        assert_eq!(stats.record_count, 1);
        assert_eq!(stats.dead_count, 0);
        assert_eq!(result.records_read, 5);
        assert_eq!(result.records_dropped, 4);
        assert_eq!(result.files_deleted, 1);

        assert!(dir.path().join("udac_a.cache").exists());
        assert!(!dir.path().join("udac_b.cache").exists());

        let entries = locked.entries(&stats).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, EntryState::Live);
        assert_eq!(entries[0].file_position, STATS_LEN as u64);

        locked.release().unwrap();
        let len = std::fs::metadata(table.path()).unwrap().len();
        assert_eq!(len, stats.end_offset);
    }

    #[test]
    fn test_compact_preserves_comments() {
        let (dir, table) = setup(100);
        let locked = table.lock(LockMode::Write).unwrap();
        let (stats, _) = locked.read_stats().unwrap();

        let (stats, a) = locked.append(&stats, &entry(&dir, "a", 0), None).unwrap();
        let comment = b"# written by hand\n";
        locked.write_at(stats.end_offset, comment).unwrap();
        let stats = CacheStats {
            end_offset: stats.end_offset + comment.len() as u64,
            ..stats
        };
        locked.write_stats(&stats).unwrap();
        let (stats, _) = locked
            .append(&stats, &a.with_state(EntryState::Dead, 0), Some(&a))
            .unwrap();

        let (stats, result) = locked.compact(&stats).unwrap();
        assert_eq!(result.comments_kept, 1);
        assert_eq!(stats.record_count, 0);
        locked.release().unwrap();

        let raw = std::fs::read(table.path()).unwrap();
        assert_eq!(&raw[STATS_LEN..], comment);
    }

    #[test]
    fn test_compact_evicts_oldest_first() {
        let (dir, table) = setup(2);
        let locked = table.lock(LockMode::Write).unwrap();
        let (mut stats, _) = locked.read_stats().unwrap();

        let now = unix_now();
        for (source, ts) in [("new", now + 300), ("old", now + 100), ("mid", now + 200)] {
            stats = locked.append(&stats, &entry(&dir, source, ts), None).unwrap().0;
        }

        let (stats, result) = locked.compact(&stats).unwrap();
        assert_eq!(result.entries_evicted, 1);
        assert_eq!(stats.record_count, 2);
        assert!(!dir.path().join("udac_old.cache").exists());

        let sources: Vec<String> = locked
            .entries(&stats)
            .unwrap()
            .into_iter()
            .map(|e| e.key.source().to_string())
            .collect();
        assert_eq!(sources, vec!["mid", "new"]);
    }

    #[test]
    fn test_compact_eviction_ignores_reads() {
        let (dir, table) = setup(1);
        let locked = table.lock(LockMode::Write).unwrap();
        let (mut stats, _) = locked.read_stats().unwrap();

        let (s, a) = locked.append(&stats, &entry(&dir, "a", 0), None).unwrap();
        stats = s;
        stats = locked.append(&stats, &entry(&dir, "b", 0), None).unwrap().0;

        // Checkout and check-in of "a" move its latest record past "b"
        let checkout = a.with_state(EntryState::Locked, unix_now());
        let (s, checkout) = locked.append(&stats, &checkout, Some(&a)).unwrap();
        stats = s;
        stats = locked
            .append(&stats, &checkout.with_state(EntryState::Live, 0), Some(&checkout))
            .unwrap()
            .0;

        let (stats, result) = locked.compact(&stats).unwrap();
        assert_eq!(result.entries_evicted, 1);
        let entries = locked.entries(&stats).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key.source(), "b");
        assert!(!dir.path().join("udac_a.cache").exists());
    }

    #[test]
    fn test_compact_keeps_insertion_order_for_equal_timestamps() {
        let (dir, table) = setup(100);
        let locked = table.lock(LockMode::Write).unwrap();
        let (mut stats, _) = locked.read_stats().unwrap();

        let mut first = None;
        for source in ["a", "b", "c"] {
            let (s, e) = locked.append(&stats, &entry(&dir, source, 0), None).unwrap();
            stats = s;
            first.get_or_insert(e);
        }
        let a = first.unwrap();
        stats = locked
            .append(&stats, &a.with_state(EntryState::Live, 0), Some(&a))
            .unwrap()
            .0;

        let (stats, _) = locked.compact(&stats).unwrap();
        let sources: Vec<String> = locked
            .entries(&stats)
            .unwrap()
            .into_iter()
            .map(|e| e.key.source().to_string())
            .collect();
        assert_eq!(sources, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_compact_never_evicts_checked_out_entries() {
        let (dir, table) = setup(1);
        let locked = table.lock(LockMode::Write).unwrap();
        let (mut stats, _) = locked.read_stats().unwrap();

        let now = unix_now();
        let busy = entry(&dir, "busy", 0).with_state(EntryState::Locked, now - 20);
        stats = locked.append(&stats, &busy, None).unwrap().0;
        stats = locked.append(&stats, &entry(&dir, "idle", now + 500), None).unwrap().0;

        let (stats, result) = locked.compact(&stats).unwrap();
        assert_eq!(result.entries_evicted, 1);
        assert_eq!(stats.record_count, 1);
        let entries = locked.entries(&stats).unwrap();
        assert_eq!(entries[0].key.source(), "busy");
    }

    #[test]
    fn test_compact_skips_unsafe_file_names() {
        let (dir, table) = setup(100);
        let outside = dir.path().join("outside.txt");
        std::fs::write(&outside, "keep").unwrap();

        let locked = table.lock(LockMode::Write).unwrap();
        let (stats, _) = locked.read_stats().unwrap();
        let rogue = CacheEntry::new(RequestKey::new("SIG", "x").unwrap(), "../outside.txt", 0)
            .with_state(EntryState::Dead, 0);
        let (stats, _) = locked.append(&stats, &rogue, None).unwrap();

        let (_, result) = locked.compact(&stats).unwrap();
        assert_eq!(result.files_deleted, 0);
        assert!(outside.exists());
    }
}
