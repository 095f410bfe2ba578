//! CRC32 checksum utilities.
//!
//! Used for two unrelated purposes: the lookup fingerprint of a request key
//! and the integrity check of payload file bodies.

use crc32fast::Hasher;

/// Compute CRC32 checksum of the given data.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Extend an existing CRC32 with more data.
///
/// `crc32_extend(crc32(a), b) == crc32(a ++ b)`, which is what makes the
/// running two-part request fingerprint possible.
pub fn crc32_extend(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}

/// Verify that data matches expected CRC.
pub fn verify_crc(data: &[u8], expected: u32) -> bool {
    crc32(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_crc32_different_data() {
        let crc1 = crc32(b"AMC_PLASMA_CURRENT");
        let crc2 = crc32(b"AMC_PLASMA_VOLTAGE");
        assert_ne!(crc1, crc2);
    }

    #[test]
    fn test_crc32_extend_is_running_checksum() {
        let whole = crc32(b"AMC_PLASMA_CURRENT12345");
        let running = crc32_extend(crc32(b"AMC_PLASMA_CURRENT"), b"12345");
        assert_eq!(whole, running);
    }

    #[test]
    fn test_crc32_extend_order_matters() {
        let ab = crc32_extend(crc32(b"signal"), b"source");
        let ba = crc32_extend(crc32(b"source"), b"signal");
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_verify_crc() {
        let data = b"test data";
        let crc = crc32(data);

        assert!(verify_crc(data, crc));
        assert!(!verify_crc(data, crc.wrapping_add(1)));
        assert!(!verify_crc(b"other data", crc));
    }
}
