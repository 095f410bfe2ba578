//! Whole-file advisory locking of the cache table.
//!
//! Locks are `flock(2)` locks, owned by the open file description. Every
//! table operation opens its own handle, so two threads of one process
//! exclude each other exactly like two processes do.

use std::fs::File;
use std::thread;

use rand::Rng;
use tracing::{error, trace};

use crate::error::{Error, Result};
use crate::options::Options;

/// Requested lock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock for scans.
    Read,
    /// Exclusive lock for anything that modifies the table.
    Write,
    /// Release a held lock.
    Unlock,
}

/// Outcome of a single non-blocking lock attempt.
enum Attempt {
    Acquired,
    Contended,
}

#[cfg(unix)]
fn try_flock(file: &File, mode: LockMode) -> std::io::Result<Attempt> {
    use std::os::unix::io::AsRawFd;

    let op = match mode {
        LockMode::Read => libc::LOCK_SH | libc::LOCK_NB,
        LockMode::Write => libc::LOCK_EX | libc::LOCK_NB,
        LockMode::Unlock => libc::LOCK_UN,
    };
    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, op) };
    if result == 0 {
        return Ok(Attempt::Acquired);
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(Attempt::Contended),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn try_flock(_file: &File, _mode: LockMode) -> std::io::Result<Attempt> {
    Ok(Attempt::Acquired)
}

/// Apply a lock operation to the table handle.
///
/// Acquisition retries up to `max_lock_attempts` times with a random delay
/// from the configured backoff range between attempts. Returns the number of
/// retries that were needed.
pub fn lock(file: &File, mode: LockMode, options: &Options) -> Result<u32> {
    if mode == LockMode::Unlock {
        return unlock_with(|| try_flock(file, mode));
    }

    let attempts = options.max_lock_attempts.max(1);
    let min = options.lock_backoff_min.as_nanos() as u64;
    let max = options.lock_backoff_max.as_nanos() as u64;
    let mut rng = rand::thread_rng();

    for attempt in 0..attempts {
        match try_flock(file, mode)? {
            Attempt::Acquired => {
                if attempt > 0 {
                    trace!(?mode, retries = attempt, "cache table lock acquired after retry");
                }
                return Ok(attempt);
            }
            Attempt::Contended => {
                if attempt + 1 < attempts {
                    let delay = if max > min { rng.gen_range(min..=max) } else { min };
                    thread::sleep(std::time::Duration::from_nanos(delay));
                }
            }
        }
    }

    Err(Error::LockTimeout { attempts })
}

/// Release a lock, retrying once if the call was interrupted.
fn unlock_with<F>(mut attempt: F) -> Result<u32>
where
    F: FnMut() -> std::io::Result<Attempt>,
{
    for retries in 0..2 {
        match attempt() {
            Ok(Attempt::Acquired) => return Ok(retries),
            Ok(Attempt::Contended) => trace!(retries, "cache table unlock interrupted"),
            Err(e) => {
                error!(error = %e, "cache table lock not released");
                return Err(Error::LockRelease(e.to_string()));
            }
        }
    }

    error!("cache table unlock interrupted twice");
    Err(Error::LockRelease("unlock interrupted".into()))
}
