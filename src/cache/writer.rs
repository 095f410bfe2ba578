//! Write path: reserve a payload name, write the payload, commit metadata.

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::Timer;
use crate::payload::{self, PayloadCodec};
use crate::table::{CacheTable, LockMode};
use crate::types::{CacheEntry, RequestKey};
use crate::util::{filename, unix_now};

use super::FileCache;

/// Result of a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new entry was created.
    Stored,
    /// The key already had an entry; nothing was written.
    AlreadyCached,
}

pub(super) fn write<C: PayloadCodec>(
    cache: &FileCache,
    codec: &C,
    key: &RequestKey,
    value: &C::Value,
) -> Result<WriteOutcome> {
    let metrics = cache.metrics();
    let options = cache.options();
    let _timer = Timer::new(&metrics.write_latency);
    let table = cache.open_table()?;

    {
        let locked = cache.lock(&table, LockMode::Read)?;
        let stats = locked.load_stats()?;
        let existing = locked.find(&stats, key)?;
        locked.release()?;
        if existing.is_some() {
            metrics.writes_skipped.inc();
            return Ok(WriteOutcome::AlreadyCached);
        }
    }

    let name = filename::payload_file_name(&key.digest(), rand::random());
    let mut body = BytesMut::new();
    codec.encode(value, &mut body)?;
    let written = payload::write_file(&options.cache_dir, &name, &body, options.sync_payloads)?;

    let committed = commit(cache, &table, key, &name);
    if !matches!(committed, Ok(true)) {
        if let Some(path) = filename::resolve_in_dir(&options.cache_dir, &name) {
            if let Err(e) = filename::delete_file(&path) {
                warn!(error = %e, path = %path.display(), "failed to remove uncommitted payload");
            }
        }
    }

    if committed? {
        metrics.writes.inc();
        metrics.bytes_written.add(written);
        debug!(key = %key, file = %name, bytes = written, "cached payload");
        Ok(WriteOutcome::Stored)
    } else {
        metrics.writes_skipped.inc();
        debug!(key = %key, "cache entry created concurrently, discarding payload");
        Ok(WriteOutcome::AlreadyCached)
    }
}

/// Append the Live record for `key`, unless an entry appeared since the
/// pre-check. Returns whether the record was appended.
fn commit(cache: &FileCache, table: &CacheTable, key: &RequestKey, name: &str) -> Result<bool> {
    let locked = cache.lock(table, LockMode::Write)?;
    let (stats, compaction) = locked.read_stats_for_append()?;
    cache.record_compaction(compaction.as_ref());

    let current = locked.current(&stats, key)?;
    if current.as_ref().is_some_and(|e| !e.state.is_dead()) {
        locked.release()?;
        return Ok(false);
    }

    let expiry = cache.options().expiry_for(unix_now());
    let entry = CacheEntry::new(key.clone(), name, expiry);
    locked.append(&stats, &entry, current.as_ref())?;

    // Committed: the payload must survive an unlock failure.
    if let Err(e) = locked.release() {
        warn!(error = %e, key = %key, "cache entry committed but table unlock failed");
    }
    Ok(true)
}
