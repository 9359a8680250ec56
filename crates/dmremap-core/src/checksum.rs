//! Checksum and little-endian field codec for the metadata region.
//!
//! The metadata checksum is a CRC32 (IEEE) over the header bytes that follow
//! the checksum field, concatenated with the live entry bytes. Magic, version
//! and the checksum field itself are outside the covered region.

use tracing::debug;

/// First header byte covered by the checksum.
pub const CHECKSUM_COVER_START: usize = 16;

/// Computes a CRC32 over several byte slices as if they were contiguous.
pub fn crc32(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Computes the metadata checksum over `header[16..]` and the live entry bytes.
pub fn metadata_checksum(header_page: &[u8], live_entries: &[u8]) -> u32 {
    let covered = header_page.get(CHECKSUM_COVER_START..).unwrap_or(&[]);
    let value = crc32(&[covered, live_entries]);
    debug!(
        value = value,
        header_bytes = covered.len(),
        entry_bytes = live_entries.len(),
        "computed metadata checksum"
    );
    value
}

/// Verifies a stored checksum against the header page and live entries.
///
/// On mismatch the computed value is returned as the error.
pub fn verify_metadata(expected: u32, header_page: &[u8], live_entries: &[u8]) -> Result<(), u32> {
    let actual = metadata_checksum(header_page, live_entries);
    if actual != expected {
        debug!(expected = expected, actual = actual, "metadata checksum mismatch");
        return Err(actual);
    }
    Ok(())
}

/// Writes `value` as little-endian u32 at `offset`.
pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Writes `value` as little-endian u64 at `offset`.
pub fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Reads a little-endian u32 at `offset`.
pub fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

/// Reads a little-endian u64 at `offset`.
pub fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_value() {
        // Standard CRC-32 check value.
        assert_eq!(crc32(&[b"123456789"]), 0xCBF43926);
    }

    #[test]
    fn test_crc32_split_matches_contiguous() {
        let whole = crc32(&[b"hello world"]);
        let split = crc32(&[b"hello", b" ", b"world"]);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_metadata_checksum_skips_prefix() {
        let mut page = vec![0u8; 64];
        let base = metadata_checksum(&page, &[]);
        page[0] = 0xFF;
        page[15] = 0xFF;
        assert_eq!(metadata_checksum(&page, &[]), base);
        page[16] = 0xFF;
        assert_ne!(metadata_checksum(&page, &[]), base);
    }

    #[test]
    fn test_verify_detects_entry_change() {
        let page = vec![7u8; 64];
        let mut entries = vec![1u8; 32];
        let sum = metadata_checksum(&page, &entries);
        assert_eq!(verify_metadata(sum, &page, &entries), Ok(()));
        entries[31] ^= 0x01;
        let actual = metadata_checksum(&page, &entries);
        assert_eq!(verify_metadata(sum, &page, &entries), Err(actual));
    }

    #[test]
    fn test_le_roundtrip_offsets() {
        let mut buf = [0u8; 16];
        put_u32(&mut buf, 0, 0x0403_0201);
        put_u64(&mut buf, 4, 0x0C0B_0A09_0807_0605);
        assert_eq!(&buf[0..4], &[1, 2, 3, 4]);
        assert_eq!(&buf[4..12], &[5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(get_u32(&buf, 0), 0x0403_0201);
        assert_eq!(get_u64(&buf, 4), 0x0C0B_0A09_0807_0605);
    }
}
