//! Table record lines.
//!
//! ```text
//! state;hashKey;timestamp;filename;properties;signal;source\n
//! ```
//!
//! Lines starting with `#` are comments. Matching is two-stage: the state and
//! hash prefix is parsed for every line, the rest only when the hash matches.

use crate::error::{Error, Result};
use crate::types::{CacheEntry, EntryState, RequestKey};

/// Field delimiter.
pub const DELIMITER: char = ';';

/// First byte of a comment line.
pub const COMMENT_MARKER: u8 = b'#';

const FIELD_COUNT: usize = 7;

/// One raw line of the record region.
#[derive(Debug, Clone, Copy)]
pub struct RawLine<'a> {
    /// Byte offset of the line in the table file.
    pub offset: u64,
    /// Line contents without the trailing newline.
    pub bytes: &'a [u8],
    /// Whether the line was newline-terminated.
    pub terminated: bool,
}

impl<'a> RawLine<'a> {
    /// Check for a comment line.
    pub fn is_comment(&self) -> bool {
        self.bytes.first() == Some(&COMMENT_MARKER)
    }

    /// Check for a line with nothing but whitespace.
    pub fn is_blank(&self) -> bool {
        self.bytes.iter().all(|b| b.is_ascii_whitespace())
    }

    /// Parse the state and hash fields only.
    pub fn head(&self) -> Option<(EntryState, u32)> {
        let mut fields = self.bytes.splitn(3, |b| *b == DELIMITER as u8);
        let state = std::str::from_utf8(fields.next()?).ok()?.parse().ok()?;
        let state = EntryState::from_code(state)?;
        let hash = std::str::from_utf8(fields.next()?).ok()?.parse().ok()?;
        fields.next()?;
        Some((state, hash))
    }

    /// Parse the full record.
    pub fn parse(&self) -> Result<CacheEntry> {
        if !self.terminated {
            return Err(self.corrupt("unterminated record"));
        }
        let text = std::str::from_utf8(self.bytes).map_err(|_| self.corrupt("not valid UTF-8"))?;
        let fields: Vec<&str> = text.splitn(FIELD_COUNT, DELIMITER).collect();
        if fields.len() != FIELD_COUNT {
            return Err(self.corrupt(format!("expected {} fields", FIELD_COUNT)));
        }

        let state = fields[0]
            .parse()
            .ok()
            .and_then(EntryState::from_code)
            .ok_or_else(|| self.corrupt(format!("bad state {:?}", fields[0])))?;
        let hash_key = fields[1]
            .parse()
            .map_err(|_| self.corrupt(format!("bad hash {:?}", fields[1])))?;
        let timestamp = fields[2]
            .parse()
            .map_err(|_| self.corrupt(format!("bad timestamp {:?}", fields[2])))?;
        let properties = fields[4]
            .parse()
            .map_err(|_| self.corrupt(format!("bad properties {:?}", fields[4])))?;
        let key = RequestKey::new(fields[5], fields[6]).map_err(|e| self.corrupt(e.to_string()))?;

        Ok(CacheEntry {
            file_position: self.offset,
            state,
            hash_key,
            timestamp,
            filename: fields[3].to_string(),
            properties,
            key,
        })
    }

    fn corrupt(&self, msg: impl Into<String>) -> Error {
        Error::corruption(format!("record at offset {}: {}", self.offset, msg.into()))
    }
}

/// Render a record line, newline included.
pub fn encode(entry: &CacheEntry) -> String {
    format!(
        "{}{d}{}{d}{}{d}{}{d}{}{d}{}{d}{}\n",
        entry.state.code(),
        entry.hash_key,
        entry.timestamp,
        entry.filename,
        entry.properties,
        entry.key.signal(),
        entry.key.source(),
        d = DELIMITER
    )
}

/// Split a record region into lines. `base` is the file offset of `buf[0]`.
pub fn lines(buf: &[u8], base: u64) -> impl Iterator<Item = RawLine<'_>> {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos >= buf.len() {
            return None;
        }
        let start = pos;
        let (end, terminated) = match buf[start..].iter().position(|b| *b == b'\n') {
            Some(n) => (start + n, true),
            None => (buf.len(), false),
        };
        pos = if terminated { end + 1 } else { end };
        Some(RawLine {
            offset: base + start as u64,
            bytes: &buf[start..end],
            terminated,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CacheEntry {
        let key = RequestKey::new("AMC_PLASMA_CURRENT", "12345").unwrap();
        CacheEntry::new(key, "udac_ab-0000000000000001.cache", 0)
    }

    #[test]
    fn test_encode_layout() {
        let e = entry();
        let line = encode(&e);
        assert_eq!(
            line,
            format!(
                "1;{};0;udac_ab-0000000000000001.cache;0;AMC_PLASMA_CURRENT;12345\n",
                e.hash_key
            )
        );
    }

    #[test]
    fn test_lines_and_parse() {
        let e = entry();
        let locked = e.with_state(EntryState::Locked, 77);
        let region = format!("# comment\n{}\n{}", encode(&e), encode(&locked));

        let parsed: Vec<RawLine<'_>> = lines(region.as_bytes(), 30).collect();
        assert_eq!(parsed.len(), 4);
        assert!(parsed[0].is_comment());
        assert!(parsed[2].is_blank());

        assert_eq!(parsed[1].offset, 30 + "# comment\n".len() as u64);
        assert_eq!(parsed[1].head(), Some((EntryState::Live, e.hash_key)));

        let back = parsed[3].parse().unwrap();
        assert_eq!(back.state, EntryState::Locked);
        assert_eq!(back.timestamp, 77);
        assert_eq!(back.key, e.key);
        assert_eq!(back.file_position, parsed[3].offset);
    }

    #[test]
    fn test_parse_rejects_damaged_lines() {
        let good = encode(&entry());
        let truncated = &good[..good.len() - 4];

        let line = lines(truncated.as_bytes(), 0).next().unwrap();
        assert!(!line.terminated);
        assert!(line.parse().unwrap_err().is_corruption());

        let garbage = lines(b"9;x;y\n", 0).next().unwrap();
        assert_eq!(garbage.head(), None);
        assert!(garbage.parse().is_err());
    }

    #[test]
    fn test_empty_source_round_trips() {
        let key = RequestKey::new("SIG", "").unwrap();
        let e = CacheEntry::new(key.clone(), "udac_x.cache", 5);
        let text = encode(&e);
        let back = lines(text.as_bytes(), 0).next().unwrap().parse().unwrap();
        assert_eq!(back.key, key);
    }
}
