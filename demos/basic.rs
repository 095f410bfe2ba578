// Basic usage of the file cache.
//
// Run with `RUST_LOG=udacache=debug cargo run --example basic` to see the
// cache's own logging. Set UDA_CACHE_DIR and UDA_CACHE_TABLE to use a
// shared directory instead of a temporary one.

use bytes::Bytes;
use tracing_subscriber::{fmt, EnvFilter};
use udacache::{Error, FileCache, Options, RequestKey, WriteOutcome};

const DEFAULT_FILTER: &str = "info";

/// Stand-in for the remote data server.
fn fetch_from_server(key: &RequestKey) -> Bytes {
    let samples: Vec<u8> = key.signal().bytes().cycle().take(100).collect();
    Bytes::from(samples)
}

fn main() -> Result<(), Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    fmt().with_env_filter(filter).with_target(false).compact().init();

    // ===========================================
    // Opening
    // ===========================================

    let scratch = tempfile::tempdir()?;
    let cache = match FileCache::from_env()? {
        Some(cache) => cache,
        None => FileCache::open(Options {
            cache_dir: scratch.path().to_path_buf(),
            ..Options::default()
        })?,
    };
    println!("cache table: {}", cache.options().table_path().display());

    // ===========================================
    // Read-through
    // ===========================================

    let key = RequestKey::new("AMC_PLASMA_CURRENT", "12345")?;

    for attempt in 1..=3 {
        let data = match cache.read(&key) {
            Ok(Some(data)) => {
                println!("attempt {}: cache hit, {} bytes", attempt, data.len());
                data
            }
            Ok(None) => {
                let data = fetch_from_server(&key);
                if cache.write(&key, data.clone())? == WriteOutcome::Stored {
                    println!("attempt {}: fetched and cached {} bytes", attempt, data.len());
                }
                data
            }
            Err(e) if e.is_miss_equivalent() => {
                println!("attempt {}: cache unavailable ({}), fetching", attempt, e);
                fetch_from_server(&key)
            }
            Err(e) => return Err(e),
        };
        assert_eq!(data.len(), 100);
    }

    // ===========================================
    // Maintenance
    // ===========================================

    cache.invalidate(&key)?;
    println!("after invalidate: {:?}", cache.stats()?);

    let result = cache.compact()?;
    println!(
        "compaction kept {} records, deleted {} payload files",
        result.records_kept, result.files_deleted
    );

    println!("{}", cache.metrics().summary());
    Ok(())
}
