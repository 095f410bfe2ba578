//! Fixed-width stats header: `record_count;dead_count;end_offset`, padded
//! with spaces and terminated by a newline.

use crate::error::{Error, Result};
use crate::types::CacheStats;

use super::record::DELIMITER;

/// Length of the header line including its newline.
pub const STATS_LEN: usize = 30;

/// Render the header line.
///
/// Fails with [`Error::StatsOverflow`] if the numbers do not fit.
pub fn render(stats: &CacheStats) -> Result<Vec<u8>> {
    let line = format!(
        "{}{d}{}{d}{}",
        stats.record_count,
        stats.dead_count,
        stats.end_offset,
        d = DELIMITER
    );
    if line.len() > STATS_LEN - 1 {
        return Err(Error::StatsOverflow(format!(
            "{:?} exceeds {} characters",
            line,
            STATS_LEN - 1
        )));
    }

    let mut buf = format!("{:<width$}", line, width = STATS_LEN - 1).into_bytes();
    buf.push(b'\n');
    Ok(buf)
}

/// Parse a header line.
pub fn parse(header: &[u8]) -> Result<CacheStats> {
    let text = std::str::from_utf8(header)
        .map_err(|_| Error::corrupt_header("header is not valid UTF-8"))?;
    let mut fields = text.trim().split(DELIMITER);

    let mut next = |name: &str| -> Result<u64> {
        let field = fields
            .next()
            .ok_or_else(|| Error::corrupt_header(format!("missing {}", name)))?;
        field
            .trim()
            .parse()
            .map_err(|_| Error::corrupt_header(format!("bad {} {:?}", name, field)))
    };

    let stats = CacheStats {
        record_count: next("record count")?,
        dead_count: next("dead count")?,
        end_offset: next("end offset")?,
    };

    if fields.next().is_some() {
        return Err(Error::corrupt_header(format!("trailing fields in {:?}", text)));
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_is_fixed_width() {
        let stats = CacheStats {
            record_count: 3,
            dead_count: 1,
            end_offset: 512,
        };
        let line = render(&stats).unwrap();

        assert_eq!(line.len(), STATS_LEN);
        assert_eq!(&line[..9], b"3;1;512  ");
        assert_eq!(line[STATS_LEN - 1], b'\n');
        assert_eq!(parse(&line).unwrap(), stats);
    }

    #[test]
    fn test_render_overflow() {
        let stats = CacheStats {
            record_count: u64::MAX,
            dead_count: u64::MAX,
            end_offset: 1,
        };
        assert!(matches!(render(&stats), Err(Error::StatsOverflow(_))));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse(b"hello world\n").unwrap_err().is_corruption());
        assert!(parse(b"1;2\n").unwrap_err().is_corruption());
        assert!(parse(b"1;2;3;4\n").unwrap_err().is_corruption());
        assert!(parse(b"1;-2;30\n").unwrap_err().is_corruption());
    }
}
