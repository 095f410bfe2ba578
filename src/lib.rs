//! # udacache
//!
//! A local, disk-resident cache of remote data requests, shared by every
//! process on the host that points at the same cache directory.
//!
//! ## Features
//!
//! - **Keyed by request**: entries are addressed by a `(signal, source)` pair
//! - **Multi-process safe**: a whole-file advisory lock guards the metadata table
//! - **Entry lifecycle**: Live, Locked (checked out by a reader) and Dead states
//! - **Append-only table**: state changes append records; compaction reclaims them
//! - **Bounded size**: compaction evicts the oldest entries beyond `max_records`
//! - **Checked payloads**: each payload file is framed with its length and CRC32
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use udacache::{FileCache, Options, RequestKey};
//!
//! let cache = FileCache::open(Options {
//!     cache_dir: "/tmp/udacache".into(),
//!     ..Options::default()
//! })?;
//!
//! let key = RequestKey::new("AMC_PLASMA_CURRENT", "12345")?;
//! if cache.read(&key)?.is_none() {
//!     let payload = fetch_from_server(&key)?;
//!     cache.write(&key, payload)?;
//! }
//! ```

// Public modules
pub mod error;
pub mod metrics;
pub mod options;
pub mod payload;
pub mod table;
pub mod types;

// Cache context
mod cache;

// Internal modules
mod util;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::{Options, OptionsBuilder};
pub use types::{CacheEntry, CacheStats, EntryState, RequestKey};

// Cache
pub use cache::{FileCache, WriteOutcome};

// Payloads
pub use payload::{PayloadCodec, RawCodec};

// Compaction
pub use table::CompactionStats;

// Metrics
pub use metrics::{CacheMetrics, MetricsSummary};
