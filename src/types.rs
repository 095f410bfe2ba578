//! Core types for udacache.

use std::fmt;

use crate::error::{Error, Result};
use crate::util::crc::{crc32, crc32_extend};

/// Lifecycle state of a cache entry, stored as a single digit in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryState {
    /// Logically deleted; awaits physical removal by compaction.
    Dead = 0,
    /// Valid and available.
    Live = 1,
    /// Checked out by a reader.
    Locked = 2,
}

impl EntryState {
    /// Create from the numeric table code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(EntryState::Dead),
            1 => Some(EntryState::Live),
            2 => Some(EntryState::Locked),
            _ => None,
        }
    }

    /// Convert to the numeric table code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Check if this is the tombstone state.
    pub fn is_dead(&self) -> bool {
        matches!(self, EntryState::Dead)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryState::Dead => "dead",
            EntryState::Live => "live",
            EntryState::Locked => "locked",
        };
        f.write_str(name)
    }
}

/// Logical request identifying a cached data object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    signal: String,
    source: String,
}

impl RequestKey {
    /// Characters that cannot appear in a key stored in the table.
    pub const RESERVED: [char; 3] = [';', '\n', '\r'];

    /// Create a request key.
    ///
    /// Fails with [`Error::InvalidKey`] if either part contains the field
    /// delimiter or a line break.
    pub fn new(signal: impl Into<String>, source: impl Into<String>) -> Result<Self> {
        let signal = signal.into();
        let source = source.into();

        for (part, value) in [("signal", &signal), ("source", &source)] {
            if let Some(c) = value.chars().find(|c| Self::RESERVED.contains(c)) {
                return Err(Error::invalid_key(format!(
                    "{} {:?} contains reserved character {:?}",
                    part, value, c
                )));
            }
        }

        Ok(Self { signal, source })
    }

    /// The signal name.
    pub fn signal(&self) -> &str {
        &self.signal
    }

    /// The source identifier.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Lookup fingerprint: CRC32 over the signal, continued over the source.
    ///
    /// Only a pre-filter; matches are confirmed by comparing the key.
    pub fn hash_key(&self) -> u32 {
        crc32_extend(crc32(self.signal.as_bytes()), self.source.as_bytes())
    }

    /// Collision-resistant digest of the full key, 32 hex characters.
    ///
    /// Each part is length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in [&self.signal, &self.source] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        let hex = hasher.finalize().to_hex();
        hex.as_str()[..32].to_string()
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.signal, self.source)
    }
}

/// Table header statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entry records physically in the table, dead ones included.
    pub record_count: u64,
    /// Records awaiting physical removal.
    pub dead_count: u64,
    /// Byte offset just past the last valid record.
    pub end_offset: u64,
}

impl CacheStats {
    /// Stats of a freshly bootstrapped table.
    pub fn empty(header_len: u64) -> Self {
        Self {
            record_count: 0,
            dead_count: 0,
            end_offset: header_len,
        }
    }
}

/// One record of the metadata table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Byte offset of the record in the table. Not persisted.
    pub file_position: u64,
    /// Lifecycle state.
    pub state: EntryState,
    /// Lookup fingerprint of the key.
    pub hash_key: u32,
    /// Expiry for Live records (`0` never expires), checkout instant for
    /// Locked records.
    pub timestamp: u64,
    /// Payload file name inside the cache directory.
    pub filename: String,
    /// Reserved, always `0`.
    pub properties: u32,
    /// The request this entry caches.
    pub key: RequestKey,
}

impl CacheEntry {
    /// Create a new Live entry for `key`.
    pub fn new(key: RequestKey, filename: impl Into<String>, timestamp: u64) -> Self {
        Self {
            file_position: 0,
            state: EntryState::Live,
            hash_key: key.hash_key(),
            timestamp,
            filename: filename.into(),
            properties: 0,
            key,
        }
    }

    /// Copy of this entry with another state and timestamp.
    pub fn with_state(&self, state: EntryState, timestamp: u64) -> Self {
        Self {
            state,
            timestamp,
            ..self.clone()
        }
    }

    /// Check if this record belongs to `key`.
    pub fn key_matches(&self, key: &RequestKey) -> bool {
        self.hash_key == key.hash_key() && self.key == *key
    }

    /// Whether the entry may be served at time `now`.
    ///
    /// Does not check that the payload file exists.
    pub fn is_valid_at(&self, now: u64, max_lock_secs: u64) -> bool {
        match self.state {
            EntryState::Dead => false,
            EntryState::Live => self.timestamp == 0 || self.timestamp >= now,
            EntryState::Locked => self.timestamp.saturating_add(max_lock_secs) >= now,
        }
    }

    /// Whether this is a checkout still inside its grace period.
    pub fn is_checked_out_at(&self, now: u64, max_lock_secs: u64) -> bool {
        self.state == EntryState::Locked && self.is_valid_at(now, max_lock_secs)
    }
}
