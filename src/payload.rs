//! Payload files.
//!
//! Each cache entry owns one payload file holding the codec output in a
//! small frame:
//!
//! ```text
//! +--------+-------------+------------+------------------+
//! | "UDAC" | len (u64 LE)| crc (u32 LE)| body (len bytes)|
//! +--------+-------------+------------+------------------+
//! ```
//!
//! Files are written to a temporary name in the cache directory and renamed
//! into place, so a payload file that exists is always complete.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::util::crc::{crc32, verify_crc};
use crate::util::filename;

/// Frame magic.
pub const PAYLOAD_MAGIC: &[u8; 4] = b"UDAC";

/// Frame header length.
pub const FRAME_HEADER_LEN: usize = 4 + 8 + 4;

/// Converts cached values to and from payload bytes.
///
/// The binary layout of cached data objects belongs to the caller; the
/// cache only stores what the codec produces.
pub trait PayloadCodec {
    /// Type of the cached value.
    type Value;

    /// Append the encoding of `value` to `buf`.
    fn encode(&self, value: &Self::Value, buf: &mut BytesMut) -> Result<()>;

    /// Decode a value from a payload body.
    fn decode(&self, body: Bytes) -> Result<Self::Value>;
}

/// Stores bytes as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl PayloadCodec for RawCodec {
    type Value = Bytes;

    fn encode(&self, value: &Bytes, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(value);
        Ok(())
    }

    fn decode(&self, body: Bytes) -> Result<Bytes> {
        Ok(body)
    }
}

/// Frame a payload body.
pub fn frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.put_slice(PAYLOAD_MAGIC);
    buf.put_u64_le(body.len() as u64);
    buf.put_u32_le(crc32(body));
    buf.put_slice(body);
    buf.freeze()
}

/// Check a frame and return its body.
pub fn unframe(mut data: Bytes) -> Result<Bytes> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(Error::invalid_format(format!(
            "payload of {} bytes is shorter than its frame header",
            data.len()
        )));
    }
    if &data[..4] != PAYLOAD_MAGIC {
        return Err(Error::invalid_format("bad payload magic"));
    }
    data.advance(4);

    let len = data.get_u64_le();
    let expected = data.get_u32_le();
    if len != data.len() as u64 {
        return Err(Error::invalid_format(format!(
            "payload body is {} bytes, frame says {}",
            data.len(),
            len
        )));
    }

    if !verify_crc(&data, expected) {
        return Err(Error::CrcMismatch {
            expected,
            actual: crc32(&data),
        });
    }

    Ok(data)
}

/// Write a framed payload to `dir/name` through a temporary file.
///
/// Returns the number of bytes written.
pub fn write_file(dir: &Path, name: &str, body: &[u8], sync: bool) -> Result<u64> {
    let target = filename::resolve_in_dir(dir, name)
        .ok_or_else(|| Error::internal(format!("invalid payload file name {:?}", name)))?;
    let temp = filename::temp_file_path(dir, rand::random());
    let framed = frame(body);

    let result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)?;
        file.write_all(&framed)?;
        if sync {
            file.sync_all()?;
        }
        drop(file);
        std::fs::rename(&temp, &target)?;
        if sync {
            filename::sync_dir(dir)?;
        }
        Ok(())
    })();

    if let Err(e) = result {
        let _ = filename::delete_file(&temp);
        return Err(e);
    }

    Ok(framed.len() as u64)
}

/// Read and check the payload file at `path`.
pub fn read_file(path: &Path) -> Result<Bytes> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    unframe(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_frame_layout() {
        let framed = frame(b"abc");
        assert_eq!(framed.len(), FRAME_HEADER_LEN + 3);
        assert_eq!(&framed[..4], b"UDAC");
        assert_eq!(&framed[4..12], &3u64.to_le_bytes());
        assert_eq!(unframe(framed).unwrap(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_unframe_detects_damage() {
        let framed = frame(b"payload body").to_vec();

        let mut flipped = framed.clone();
        *flipped.last_mut().unwrap() ^= 0xff;
        assert!(matches!(
            unframe(Bytes::from(flipped)),
            Err(Error::CrcMismatch { .. })
        ));

        let truncated = Bytes::from(framed[..framed.len() - 1].to_vec());
        assert!(matches!(unframe(truncated), Err(Error::InvalidFormat(_))));

        let mut bad_magic = framed.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            unframe(Bytes::from(bad_magic)),
            Err(Error::InvalidFormat(_))
        ));

        assert!(unframe(Bytes::from_static(b"UDA")).is_err());
    }

    #[test]
    fn test_write_then_read_file() {
        let dir = tempdir().unwrap();
        let written = write_file(dir.path(), "udac_x.cache", b"hello", true).unwrap();
        assert_eq!(written, (FRAME_HEADER_LEN + 5) as u64);

        let path = dir.path().join("udac_x.cache");
        assert!(filename::file_exists(&path));
        assert_eq!(read_file(&path).unwrap(), Bytes::from_static(b"hello"));

        let leftovers = filename::list_files_of_type(dir.path(), filename::FileType::Temp).unwrap();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempdir().unwrap();
        let err = read_file(&dir.path().join("udac_gone.cache")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_write_rejects_path_names() {
        let dir = tempdir().unwrap();
        assert!(write_file(dir.path(), "../x.cache", b"x", false).is_err());
    }
}
