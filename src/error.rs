//! Error types for udacache.

use std::io;
use thiserror::Error;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cache operations.
///
/// A cache miss is never an error; these describe failures of the cache
/// machinery itself. Callers are expected to fall back to the remote server.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error from table or payload file operations.
    #[error("I/O error: {0}")]
    Io(String),

    /// The fixed-width stats header could not be parsed.
    #[error("Corrupt table header: {0}")]
    CorruptHeader(String),

    /// A table record or region is unreadable.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// A payload file does not carry the expected frame.
    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    /// Payload CRC mismatch.
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// The table lock could not be obtained within the retry budget.
    #[error("Unable to lock the cache table after {attempts} attempts")]
    LockTimeout { attempts: u32 },

    /// Releasing the table lock failed.
    #[error("Cache table lock not released: {0}")]
    LockRelease(String),

    /// The rendered stats header does not fit its fixed width.
    #[error("Invalid cache stats record: {0}")]
    StatsOverflow(String),

    /// Request key cannot be stored in the delimited table format.
    #[error("Invalid request key: {0}")]
    InvalidKey(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The payload codec failed to encode or decode a value.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a corruption error with the given message.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create a corrupt header error.
    pub fn corrupt_header<S: Into<String>>(msg: S) -> Self {
        Error::CorruptHeader(msg.into())
    }

    /// Create an invalid format error.
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Error::InvalidFormat(msg.into())
    }

    /// Create an invalid key error.
    pub fn invalid_key<S: Into<String>>(msg: S) -> Self {
        Error::InvalidKey(msg.into())
    }

    /// Create a codec error.
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Error::Codec(msg.into())
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Check if retrying the same operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::LockTimeout { .. } | Error::Io(_))
    }

    /// Check if this error indicates corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corruption(_)
                | Error::CorruptHeader(_)
                | Error::CrcMismatch { .. }
                | Error::InvalidFormat(_)
        )
    }

    /// Check if the caller should treat this failure like a miss and fetch
    /// the data from the remote server instead.
    ///
    /// Only misuse of the API (bad keys, bad configuration) is excluded.
    pub fn is_miss_equivalent(&self) -> bool {
        !matches!(self, Error::InvalidKey(_) | Error::InvalidConfiguration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::corrupt_header("bad stats");
        assert_eq!(format!("{}", err), "Corrupt table header: bad stats");

        let err = Error::LockTimeout { attempts: 100 };
        assert_eq!(
            format!("{}", err),
            "Unable to lock the cache table after 100 attempts"
        );
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::LockTimeout { attempts: 1 }.is_recoverable());
        assert!(!Error::corruption("bad").is_recoverable());
        assert!(!Error::invalid_key("a;b").is_recoverable());
    }

    #[test]
    fn test_error_is_corruption() {
        assert!(Error::corrupt_header("bad").is_corruption());
        assert!(Error::CrcMismatch {
            expected: 1,
            actual: 2
        }
        .is_corruption());
        assert!(!Error::LockTimeout { attempts: 3 }.is_corruption());
    }

    #[test]
    fn test_error_is_miss_equivalent() {
        assert!(Error::LockTimeout { attempts: 3 }.is_miss_equivalent());
        assert!(Error::Io("disk full".into()).is_miss_equivalent());
        assert!(!Error::invalid_key("x").is_miss_equivalent());
        assert!(!Error::InvalidConfiguration("x".into()).is_miss_equivalent());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(ref msg) if msg.contains("gone")));
    }
}
