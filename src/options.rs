//! Configuration options for udacache.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the cache directory.
pub const ENV_CACHE_DIR: &str = "UDA_CACHE_DIR";

/// Environment variable naming the table file inside the cache directory.
pub const ENV_CACHE_TABLE: &str = "UDA_CACHE_TABLE";

/// Environment variable overriding [`Options::max_records`].
pub const ENV_MAX_RECORDS: &str = "UDA_CACHE_MAX_RECORDS";

/// Environment variable overriding [`Options::max_dead_records`].
pub const ENV_MAX_DEAD_RECORDS: &str = "UDA_CACHE_MAX_DEAD_RECORDS";

/// Environment variable setting [`Options::entry_ttl`] in seconds.
pub const ENV_TTL_SECS: &str = "UDA_CACHE_TTL_SECS";

/// Default table file name.
pub const DEFAULT_TABLE_NAME: &str = "cache.tbl";

/// Default maximum number of entries kept by compaction.
pub const DEFAULT_MAX_RECORDS: usize = 1000;

/// Default number of dead records that triggers compaction.
pub const DEFAULT_MAX_DEAD_RECORDS: usize = 10;

/// Default checkout grace period.
pub const DEFAULT_MAX_LOCK_TIME: Duration = Duration::from_secs(100);

/// Default number of lock acquisition attempts.
pub const DEFAULT_MAX_LOCK_ATTEMPTS: u32 = 100;

/// Default lower bound of the lock retry delay.
pub const DEFAULT_LOCK_BACKOFF_MIN: Duration = Duration::from_micros(1);

/// Default upper bound of the lock retry delay.
pub const DEFAULT_LOCK_BACKOFF_MAX: Duration = Duration::from_micros(10);

/// Cache configuration options.
#[derive(Debug, Clone)]
pub struct Options {
    // === Location ===
    /// Directory holding the table and payload files.
    pub cache_dir: PathBuf,

    /// Table file name inside `cache_dir`.
    pub table_name: String,

    /// Create the directory and table if they don't exist.
    pub create_if_missing: bool,

    // === Compaction ===
    /// Maximum number of entries retained after compaction.
    pub max_records: usize,

    /// Dead record count that triggers compaction.
    pub max_dead_records: usize,

    // === Locking ===
    /// How long a checkout protects an entry before it is considered abandoned.
    pub max_lock_time: Duration,

    /// Lock acquisition attempts before giving up.
    pub max_lock_attempts: u32,

    /// Lower bound of the random delay between lock attempts.
    pub lock_backoff_min: Duration,

    /// Upper bound of the random delay between lock attempts.
    pub lock_backoff_max: Duration,

    // === Entries ===
    /// Lifetime of new entries. `None` means entries never expire.
    pub entry_ttl: Option<Duration>,

    /// Fsync payload files before committing their metadata.
    pub sync_payloads: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            // Location
            cache_dir: std::env::temp_dir().join("udacache"),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            create_if_missing: true,

            // Compaction
            max_records: DEFAULT_MAX_RECORDS,
            max_dead_records: DEFAULT_MAX_DEAD_RECORDS,

            // Locking
            max_lock_time: DEFAULT_MAX_LOCK_TIME,
            max_lock_attempts: DEFAULT_MAX_LOCK_ATTEMPTS,
            lock_backoff_min: DEFAULT_LOCK_BACKOFF_MIN,
            lock_backoff_max: DEFAULT_LOCK_BACKOFF_MAX,

            // Entries
            entry_ttl: None,
            sync_payloads: true,
        }
    }
}

impl Options {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from the process environment.
    ///
    /// Returns `Ok(None)` when `UDA_CACHE_DIR` or `UDA_CACHE_TABLE` is unset;
    /// the cache is then disabled rather than misconfigured.
    pub fn from_env() -> crate::Result<Option<Options>> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load options through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> crate::Result<Option<Options>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let (dir, table) = match (present(ENV_CACHE_DIR), present(ENV_CACHE_TABLE)) {
            (Some(dir), Some(table)) => (dir, table),
            _ => return Ok(None),
        };

        let mut options = Options {
            cache_dir: PathBuf::from(dir),
            table_name: table,
            ..Options::default()
        };

        if let Some(value) = present(ENV_MAX_RECORDS) {
            options.max_records = parse_var(ENV_MAX_RECORDS, &value)?;
        }
        if let Some(value) = present(ENV_MAX_DEAD_RECORDS) {
            options.max_dead_records = parse_var(ENV_MAX_DEAD_RECORDS, &value)?;
        }
        if let Some(value) = present(ENV_TTL_SECS) {
            let secs: u64 = parse_var(ENV_TTL_SECS, &value)?;
            options.entry_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }

        options.validate()?;
        Ok(Some(options))
    }

    /// Validate the options.
    pub fn validate(&self) -> crate::Result<()> {
        if self.table_name.is_empty() || !crate::util::filename::is_plain_file_name(&self.table_name)
        {
            return Err(crate::Error::InvalidConfiguration(format!(
                "table_name must be a plain file name, got {:?}",
                self.table_name
            )));
        }

        if self.max_records == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "max_records must be at least 1".into(),
            ));
        }

        if self.max_dead_records == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "max_dead_records must be at least 1".into(),
            ));
        }

        if self.max_lock_attempts == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "max_lock_attempts must be at least 1".into(),
            ));
        }

        if self.lock_backoff_min > self.lock_backoff_max {
            return Err(crate::Error::InvalidConfiguration(
                "lock_backoff_min must be <= lock_backoff_max".into(),
            ));
        }

        Ok(())
    }

    /// Path of the table file.
    pub fn table_path(&self) -> PathBuf {
        crate::util::filename::table_file_path(&self.cache_dir, &self.table_name)
    }

    /// Expiry timestamp for an entry created at `now`, `0` if entries never
    /// expire.
    pub fn expiry_for(&self, now: u64) -> u64 {
        match self.entry_ttl {
            Some(ttl) => now.saturating_add(ttl.as_secs().max(1)),
            None => 0,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value.trim().parse().map_err(|_| {
        crate::Error::InvalidConfiguration(format!("{} has an invalid value: {:?}", name, value))
    })
}

/// Builder for Options.
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache directory.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.cache_dir = dir.into();
        self
    }

    /// Set the table file name.
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.options.table_name = name.into();
        self
    }

    /// Set create_if_missing.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.options.create_if_missing = value;
        self
    }

    /// Set max_records.
    pub fn max_records(mut self, count: usize) -> Self {
        self.options.max_records = count;
        self
    }

    /// Set max_dead_records.
    pub fn max_dead_records(mut self, count: usize) -> Self {
        self.options.max_dead_records = count;
        self
    }

    /// Set the checkout grace period.
    pub fn max_lock_time(mut self, time: Duration) -> Self {
        self.options.max_lock_time = time;
        self
    }

    /// Set the number of lock attempts.
    pub fn max_lock_attempts(mut self, attempts: u32) -> Self {
        self.options.max_lock_attempts = attempts;
        self
    }

    /// Set the random delay range between lock attempts.
    pub fn lock_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.options.lock_backoff_min = min;
        self.options.lock_backoff_max = max;
        self
    }

    /// Set the entry lifetime.
    pub fn entry_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.options.entry_ttl = ttl;
        self
    }

    /// Set sync_payloads.
    pub fn sync_payloads(mut self, value: bool) -> Self {
        self.options.sync_payloads = value;
        self
    }

    /// Build the options.
    pub fn build(self) -> crate::Result<Options> {
        self.options.validate()?;
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert!(opts.create_if_missing);
        assert_eq!(opts.table_name, DEFAULT_TABLE_NAME);
        assert_eq!(opts.max_records, 1000);
        assert_eq!(opts.max_dead_records, 10);
        assert_eq!(opts.max_lock_time, Duration::from_secs(100));
        assert_eq!(opts.max_lock_attempts, 100);
        assert!(opts.entry_ttl.is_none());
    }

    #[test]
    fn test_options_validation() {
        let mut opts = Options::default();
        assert!(opts.validate().is_ok());

        opts.table_name = "../escape.tbl".into();
        assert!(opts.validate().is_err());

        let mut opts = Options::default();
        opts.lock_backoff_min = Duration::from_millis(5);
        opts.lock_backoff_max = Duration::from_millis(1);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let opts = OptionsBuilder::new()
            .cache_dir("/tmp/udacache")
            .table_name("cache.tbl")
            .max_records(5)
            .entry_ttl(Some(Duration::from_secs(60)))
            .build()
            .unwrap();

        assert_eq!(opts.table_path(), PathBuf::from("/tmp/udacache/cache.tbl"));
        assert_eq!(opts.max_records, 5);

        assert!(OptionsBuilder::new().max_dead_records(0).build().is_err());
    }

    #[test]
    fn test_from_lookup_disabled_without_both_variables() {
        assert!(Options::from_lookup(lookup(&[])).unwrap().is_none());
        assert!(Options::from_lookup(lookup(&[(ENV_CACHE_DIR, "/tmp/udacache")]))
            .unwrap()
            .is_none());
        assert!(Options::from_lookup(lookup(&[(ENV_CACHE_TABLE, "cache.tbl")]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let opts = Options::from_lookup(lookup(&[
            (ENV_CACHE_DIR, "/tmp/udacache"),
            (ENV_CACHE_TABLE, "cache.tbl"),
            (ENV_MAX_RECORDS, "50"),
            (ENV_TTL_SECS, "3600"),
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(opts.cache_dir, PathBuf::from("/tmp/udacache"));
        assert_eq!(opts.max_records, 50);
        assert_eq!(opts.max_dead_records, DEFAULT_MAX_DEAD_RECORDS);
        assert_eq!(opts.entry_ttl, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = Options::from_lookup(lookup(&[
            (ENV_CACHE_DIR, "/tmp/udacache"),
            (ENV_CACHE_TABLE, "cache.tbl"),
            (ENV_MAX_DEAD_RECORDS, "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_expiry_for() {
        let mut opts = Options::default();
        assert_eq!(opts.expiry_for(1_000), 0);

        opts.entry_ttl = Some(Duration::from_secs(30));
        assert_eq!(opts.expiry_for(1_000), 1_030);
    }
}
