//! CRC32 as used by the DFU file suffix
//!
//! This is the IEEE 802.3 reflected polynomial with a `0xFFFFFFFF` seed.
//! Unlike the usual CRC32 the final accumulator is *not* complemented: the
//! DFU footer stores the raw running value.

/// Reflected IEEE 802.3 polynomial
const POLYNOMIAL: u32 = 0xEDB8_8320;

/// Initial accumulator value
pub const CRC32_SEED: u32 = 0xFFFF_FFFF;

const fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = make_table();

/// Continue a CRC32 computation from a previous accumulator value
pub fn crc32_update(mut accum: u32, data: &[u8]) -> u32 {
    for &byte in data {
        accum = CRC32_TABLE[((accum ^ byte as u32) & 0xFF) as usize] ^ (accum >> 8);
    }
    accum
}

/// Compute the DFU CRC32 of a byte slice
pub fn crc32(data: &[u8]) -> u32 {
    crc32_update(CRC32_SEED, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_seed() {
        assert_eq!(crc32(&[]), 0xFFFF_FFFF);
    }

    #[test]
    fn test_table_matches_reference() {
        assert_eq!(CRC32_TABLE[0], 0x0000_0000);
        assert_eq!(CRC32_TABLE[1], 0x7707_3096);
        assert_eq!(CRC32_TABLE[128], 0xEDB8_8320);
        assert_eq!(CRC32_TABLE[255], 0x2D02_EF8D);
    }

    #[test]
    fn test_uncomplemented_result() {
        // The standard CRC32 of "123456789" is 0xCBF43926; DFU keeps the
        // accumulator without the final XOR.
        assert_eq!(crc32(b"123456789"), !0xCBF4_3926);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let (a, b) = data.split_at(17);
        assert_eq!(crc32_update(crc32(a), b), crc32(data));
    }
}
