//! Read path: validate, check out, read the payload, check in.

use std::path::PathBuf;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::metrics::Timer;
use crate::payload::{self, PayloadCodec};
use crate::table::{CacheTable, LockMode};
use crate::types::{CacheEntry, EntryState, RequestKey};
use crate::util::{filename, unix_now};

use super::FileCache;

/// How the reader holds the entry while it reads the payload.
enum Checkout {
    /// We appended the Locked record and must check the entry back in.
    Owned {
        original: CacheEntry,
        checkout: CacheEntry,
    },
    /// Another reader holds an unexpired checkout; read alongside it.
    Shared,
}

pub(super) fn read<C: PayloadCodec>(
    cache: &FileCache,
    codec: &C,
    key: &RequestKey,
) -> Result<Option<C::Value>> {
    let metrics = cache.metrics();
    let _timer = Timer::new(&metrics.read_latency);
    let table = cache.open_table()?;

    // Misses are the common case; settle them under the shared lock.
    {
        let locked = cache.lock(&table, LockMode::Read)?;
        let stats = locked.load_stats()?;
        let found = locked.find(&stats, key)?;
        locked.release()?;
        if found.is_none() {
            trace!(key = %key, "cache miss");
            metrics.misses.inc();
            return Ok(None);
        }
    }

    let Some((path, checkout)) = check_out(cache, &table, key)? else {
        metrics.misses.inc();
        return Ok(None);
    };

    let result = payload::read_file(&path).and_then(|body| {
        let len = body.len() as u64;
        codec.decode(body).map(|value| (value, len))
    });

    if let Checkout::Owned { original, checkout } = &checkout {
        if let Err(e) = check_in(cache, &table, key, original, checkout, result.is_ok()) {
            warn!(error = %e, key = %key, "failed to check in cache entry");
        }
    }

    match result {
        // A missing payload is a stale entry, not a failure. Shared readers
        // do not pin the file, so compaction may remove it after the owner
        // checks in.
        Err(Error::NotFound(_)) => {
            debug!(key = %key, path = %path.display(), "cached payload vanished");
            metrics.stale_entries.inc();
            metrics.misses.inc();
            Ok(None)
        }
        Ok((value, len)) => {
            metrics.hits.inc();
            metrics.bytes_read.add(len);
            trace!(key = %key, bytes = len, "cache hit");
            Ok(Some(value))
        }
        Err(e) => {
            metrics.read_failures.inc();
            warn!(error = %e, key = %key, path = %path.display(), "failed to read cached payload");
            Err(e)
        }
    }
}

/// Validate the current entry and check it out, under the write lock.
///
/// An entry that is expired, abandoned or missing its payload is marked Dead
/// and reported as a miss.
fn check_out(
    cache: &FileCache,
    table: &CacheTable,
    key: &RequestKey,
) -> Result<Option<(PathBuf, Checkout)>> {
    let options = cache.options();
    let locked = cache.lock(table, LockMode::Write)?;
    let (stats, compaction) = locked.read_stats()?;
    cache.record_compaction(compaction.as_ref());

    let Some(entry) = locked.find(&stats, key)? else {
        locked.release()?;
        return Ok(None);
    };

    let now = unix_now();
    let lock_secs = options.max_lock_time.as_secs();
    let path = filename::resolve_in_dir(&options.cache_dir, &entry.filename)
        .filter(|p| filename::file_exists(p));

    let path = match path {
        Some(path) if entry.is_valid_at(now, lock_secs) => path,
        present => {
            debug!(
                key = %key,
                state = %entry.state,
                timestamp = entry.timestamp,
                payload_present = present.is_some(),
                "stale cache entry"
            );
            let dead = entry.with_state(EntryState::Dead, entry.timestamp);
            locked.append(&stats, &dead, Some(&entry))?;
            locked.release()?;
            cache.metrics().stale_entries.inc();
            return Ok(None);
        }
    };

    let checkout = match entry.state {
        EntryState::Locked => Checkout::Shared,
        _ => {
            let record = entry.with_state(EntryState::Locked, now);
            let (_, checkout) = locked.append(&stats, &record, Some(&entry))?;
            Checkout::Owned {
                original: entry,
                checkout,
            }
        }
    };
    locked.release()?;

    Ok(Some((path, checkout)))
}

/// Return a checked out entry to Live, or Dead if its payload was unusable.
///
/// Skipped if the entry changed since the checkout.
fn check_in(
    cache: &FileCache,
    table: &CacheTable,
    key: &RequestKey,
    original: &CacheEntry,
    checkout: &CacheEntry,
    payload_ok: bool,
) -> Result<()> {
    let locked = cache.lock(table, LockMode::Write)?;
    let (stats, compaction) = locked.read_stats()?;
    cache.record_compaction(compaction.as_ref());

    match locked.current(&stats, key)? {
        Some(current)
            if current.state == EntryState::Locked
                && current.filename == checkout.filename
                && current.timestamp == checkout.timestamp =>
        {
            let state = if payload_ok {
                EntryState::Live
            } else {
                EntryState::Dead
            };
            let record = original.with_state(state, original.timestamp);
            locked.append(&stats, &record, Some(&current))?;
        }
        _ => debug!(key = %key, "cache entry changed during checkout, not checking in"),
    }

    locked.release()
}
