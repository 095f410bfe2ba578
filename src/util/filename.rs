//! Cache directory file naming conventions.
//!
//! The cache directory holds the metadata table (name chosen by
//! configuration), one payload file per entry, and short-lived temporary
//! files used while a payload is being written.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Prefix of every payload file.
pub const PAYLOAD_PREFIX: &str = "udac_";

/// Suffix of every payload file.
pub const PAYLOAD_SUFFIX: &str = ".cache";

/// Prefix of temporary payload files.
pub const TEMP_PREFIX: &str = "tmp_";

/// File types in the cache directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Committed payload file.
    Payload,
    /// Payload still being written.
    Temp,
}

/// Generate the table file path.
pub fn table_file_path(cache_dir: &Path, table_name: &str) -> PathBuf {
    cache_dir.join(table_name)
}

/// Generate a payload file name from a key digest and a per-write nonce.
///
/// The digest identifies the key; the nonce keeps successive generations of
/// the same key in distinct files.
pub fn payload_file_name(key_digest: &str, nonce: u64) -> String {
    format!("{PAYLOAD_PREFIX}{key_digest}-{nonce:016x}{PAYLOAD_SUFFIX}")
}

/// Generate a temporary file path.
pub fn temp_file_path(cache_dir: &Path, nonce: u64) -> PathBuf {
    cache_dir.join(format!("{TEMP_PREFIX}{nonce:016x}"))
}

/// Resolve a file name read from the table into a path inside the cache
/// directory.
///
/// Returns `None` for names that would escape the directory.
pub fn resolve_in_dir(cache_dir: &Path, name: &str) -> Option<PathBuf> {
    if is_plain_file_name(name) {
        Some(cache_dir.join(name))
    } else {
        None
    }
}

/// Check that a name is a single path component.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Parse a file name and return its type.
///
/// Returns `None` if the file name doesn't match any known pattern.
pub fn parse_file_name(name: &str) -> Option<FileType> {
    if let Some(rest) = name.strip_prefix(PAYLOAD_PREFIX) {
        if rest.ends_with(PAYLOAD_SUFFIX) && rest.len() > PAYLOAD_SUFFIX.len() {
            return Some(FileType::Payload);
        }
        return None;
    }

    if let Some(nonce) = name.strip_prefix(TEMP_PREFIX) {
        if !nonce.is_empty() && nonce.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Some(FileType::Temp);
        }
    }

    None
}

/// List all files of a given type in the cache directory.
pub fn list_files_of_type(cache_dir: &Path, file_type: FileType) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    for entry in std::fs::read_dir(cache_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if parse_file_name(&name) == Some(file_type) {
            paths.push(entry.path());
        }
    }

    paths.sort();
    Ok(paths)
}

/// Remove temporary files last modified more than `max_age` ago.
///
/// Younger temp files may belong to a write in progress in another process.
pub fn remove_stale_temp_files(cache_dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;

    for path in list_files_of_type(cache_dir, FileType::Temp)? {
        let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age > max_age {
            delete_file(&path)?;
            removed += 1;
        }
    }

    Ok(removed)
}

/// Check if a file exists.
pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

/// Delete a file, ignoring "not found" errors.
pub fn delete_file(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create directory if it doesn't exist.
pub fn create_dir_if_missing(path: &Path) -> std::io::Result<()> {
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Sync a directory to ensure file operations are durable.
pub fn sync_dir(path: &Path) -> std::io::Result<()> {
    let dir = std::fs::File::open(path)?;
    dir.sync_all()
}
