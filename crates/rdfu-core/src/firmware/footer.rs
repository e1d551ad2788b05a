//! DFU file suffix and metadata table
//!
//! A DFU file ends with a 16-byte footer:
//!
//! | Offset | Size | Field                        |
//! |--------|------|------------------------------|
//! | 0      | 2    | bcdDevice (release)          |
//! | 2      | 2    | idProduct                    |
//! | 4      | 2    | idVendor                     |
//! | 6      | 2    | bcdDFU (file format version) |
//! | 8      | 3    | signature `"UFD"`            |
//! | 11     | 1    | bLength (footer + metadata)  |
//! | 12     | 4    | dwCRC                        |
//!
//! An optional metadata table sits directly in front of the footer and is
//! covered by `bLength`: `"MD"`, a one-byte entry count and then
//! length-prefixed key and value strings.

use std::collections::BTreeMap;

use crate::crc::crc32;
use crate::error::{ParseError, WriteError};

/// Size of the fixed DFU footer
pub const FOOTER_LEN: usize = 16;

/// Footer signature, stored reversed
pub const FOOTER_SIGNATURE: &[u8; 3] = b"UFD";

/// Metadata table signature
pub const METADATA_SIGNATURE: &[u8; 2] = b"MD";

/// Maximum number of metadata entries
pub const METADATA_MAX_ENTRIES: usize = 59;

/// Maximum length of a metadata key or value
pub const METADATA_MAX_STRING: usize = 233;

/// Largest table that still fits the one-byte footer length
const METADATA_MAX_TABLE: usize = u8::MAX as usize - FOOTER_LEN;

/// Decoded DFU footer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// bcdDevice
    pub release: u16,
    /// idProduct
    pub pid: u16,
    /// idVendor
    pub vid: u16,
    /// bcdDFU
    pub version: u16,
    /// Footer plus metadata length
    pub len: u8,
    /// Stored CRC
    pub crc: u32,
}

impl Footer {
    /// Read the footer from the end of `data`
    ///
    /// Returns `None` if the data is too short or the signature is absent,
    /// in which case the file is raw binary.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FOOTER_LEN {
            return None;
        }
        let f = &data[data.len() - FOOTER_LEN..];
        if &f[8..11] != FOOTER_SIGNATURE {
            return None;
        }
        Some(Self {
            release: u16::from_le_bytes([f[0], f[1]]),
            pid: u16::from_le_bytes([f[2], f[3]]),
            vid: u16::from_le_bytes([f[4], f[5]]),
            version: u16::from_le_bytes([f[6], f[7]]),
            len: f[11],
            crc: u32::from_le_bytes([f[12], f[13], f[14], f[15]]),
        })
    }

    /// Encode everything but the CRC
    fn encode_head(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..2].copy_from_slice(&self.release.to_le_bytes());
        buf[2..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[4..6].copy_from_slice(&self.vid.to_le_bytes());
        buf[6..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..11].copy_from_slice(FOOTER_SIGNATURE);
        buf[11] = self.len;
        buf
    }
}

/// Check the footer CRC and length, returning the byte range of the payload
/// and of the metadata table
pub(crate) fn validate(
    data: &[u8],
    footer: &Footer,
    check_crc: bool,
) -> Result<(usize, usize), ParseError> {
    if check_crc {
        let expected = crc32(&data[..data.len() - 4]);
        if expected != footer.crc {
            return Err(ParseError::ChecksumFailed {
                expected,
                actual: footer.crc,
            });
        }
    }

    let footer_len = footer.len as usize;
    if footer_len < FOOTER_LEN || footer_len > data.len() {
        return Err(ParseError::TruncatedFooter {
            footer_len: footer.len,
            file_len: data.len(),
        });
    }

    let payload_end = data.len() - footer_len;
    let metadata_end = data.len() - FOOTER_LEN;
    Ok((payload_end, metadata_end))
}

/// Decode a metadata table into `metadata`
///
/// A table that does not start with the `"MD"` signature is ignored.
pub(crate) fn parse_metadata(
    table: &[u8],
    metadata: &mut BTreeMap<String, String>,
) -> Result<(), ParseError> {
    if table.len() < 3 || &table[0..2] != METADATA_SIGNATURE {
        return Ok(());
    }

    let count = table[2] as usize;
    let mut idx = 3;
    for entry in 0..count {
        let key = read_string(table, &mut idx, entry, "key")?;
        let value = read_string(table, &mut idx, entry, "value")?;
        metadata.insert(key, value);
    }
    Ok(())
}

fn read_string(
    table: &[u8],
    idx: &mut usize,
    entry: usize,
    what: &str,
) -> Result<String, ParseError> {
    let len = *table.get(*idx).ok_or_else(|| {
        ParseError::CorruptMetadata(format!("entry {} {} length past end of table", entry, what))
    })? as usize;
    if len > METADATA_MAX_STRING {
        return Err(ParseError::CorruptMetadata(format!(
            "entry {} {} is {} bytes, maximum is {}",
            entry, what, len, METADATA_MAX_STRING
        )));
    }
    let start = *idx + 1;
    let bytes = table.get(start..start + len).ok_or_else(|| {
        ParseError::CorruptMetadata(format!("entry {} {} runs past end of table", entry, what))
    })?;
    *idx = start + len;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Encode a metadata table, or nothing if there is no metadata
pub(crate) fn encode_metadata(metadata: &BTreeMap<String, String>) -> Result<Vec<u8>, WriteError> {
    if metadata.is_empty() {
        return Ok(Vec::new());
    }
    if metadata.len() > METADATA_MAX_ENTRIES {
        return Err(WriteError::MetadataTooLarge(format!(
            "{} entries, maximum is {}",
            metadata.len(),
            METADATA_MAX_ENTRIES
        )));
    }

    let mut table = Vec::with_capacity(METADATA_MAX_TABLE);
    table.extend_from_slice(METADATA_SIGNATURE);
    table.push(metadata.len() as u8);
    for (key, value) in metadata {
        for s in [key, value] {
            if s.len() > METADATA_MAX_STRING {
                return Err(WriteError::MetadataTooLarge(format!(
                    "'{}' is {} bytes, maximum is {}",
                    key,
                    s.len(),
                    METADATA_MAX_STRING
                )));
            }
            table.push(s.len() as u8);
            table.extend_from_slice(s.as_bytes());
        }
    }

    if table.len() > METADATA_MAX_TABLE {
        return Err(WriteError::MetadataTooLarge(format!(
            "table is {} bytes, maximum is {}",
            table.len(),
            METADATA_MAX_TABLE
        )));
    }
    Ok(table)
}

/// Append metadata and a footer to `payload`
pub(crate) fn append(
    mut payload: Vec<u8>,
    metadata: &BTreeMap<String, String>,
    vid: u16,
    pid: u16,
    release: u16,
    version: u16,
) -> Result<Vec<u8>, WriteError> {
    let table = encode_metadata(metadata)?;
    let footer = Footer {
        release,
        pid,
        vid,
        version,
        len: (FOOTER_LEN + table.len()) as u8,
        crc: 0,
    };

    payload.extend_from_slice(&table);
    payload.extend_from_slice(&footer.encode_head());
    let crc = crc32(&payload);
    payload.extend_from_slice(&crc.to_le_bytes());
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_footer_layout() {
        let out = append(vec![0xAB; 4], &BTreeMap::new(), 0x1234, 0x5678, 0xfedc, 0x0100).unwrap();
        assert_eq!(out.len(), 4 + FOOTER_LEN);
        assert_eq!(
            &out[4..16],
            &[0xdc, 0xfe, 0x78, 0x56, 0x34, 0x12, 0x00, 0x01, b'U', b'F', b'D', 16]
        );

        let footer = Footer::parse(&out).unwrap();
        assert_eq!(footer.vid, 0x1234);
        assert_eq!(footer.pid, 0x5678);
        assert_eq!(footer.release, 0xfedc);
        assert_eq!(footer.crc, crc32(&out[..out.len() - 4]));
        assert_eq!(validate(&out, &footer, true), Ok((4, 4)));
    }

    #[test]
    fn test_no_signature_is_raw() {
        assert!(Footer::parse(&[0u8; 16]).is_none());
        assert!(Footer::parse(b"UFD").is_none());
    }

    #[test]
    fn test_bad_crc() {
        let mut out = append(vec![1, 2, 3], &BTreeMap::new(), 0, 0, 0, 0x0100).unwrap();
        out[0] ^= 0xff;
        let footer = Footer::parse(&out).unwrap();
        assert!(matches!(
            validate(&out, &footer, true),
            Err(ParseError::ChecksumFailed { .. })
        ));
        assert!(validate(&out, &footer, false).is_ok());
    }

    #[test]
    fn test_footer_length_larger_than_file() {
        let mut out = append(Vec::new(), &BTreeMap::new(), 0, 0, 0, 0x0100).unwrap();
        out[11] = 0x40;
        let footer = Footer::parse(&out).unwrap();
        assert_eq!(
            validate(&out, &footer, false),
            Err(ParseError::TruncatedFooter {
                footer_len: 0x40,
                file_len: 16
            })
        );
    }

    #[test]
    fn test_metadata_roundtrip() {
        let md = map(&[("key", "value"), ("another key", "another value")]);
        let table = encode_metadata(&md).unwrap();
        assert_eq!(&table[..3], b"MD\x02");

        let mut parsed = BTreeMap::new();
        parse_metadata(&table, &mut parsed).unwrap();
        assert_eq!(parsed, md);
    }

    #[test]
    fn test_metadata_limits() {
        let long = "x".repeat(METADATA_MAX_STRING + 1);
        assert!(matches!(
            encode_metadata(&map(&[("key", &long)])),
            Err(WriteError::MetadataTooLarge(_))
        ));
        assert!(matches!(
            encode_metadata(&map(&[(&long, "value")])),
            Err(WriteError::MetadataTooLarge(_))
        ));

        let too_many: BTreeMap<String, String> = (0..=METADATA_MAX_ENTRIES)
            .map(|i| (format!("{}", i), String::new()))
            .collect();
        assert!(matches!(
            encode_metadata(&too_many),
            Err(WriteError::MetadataTooLarge(_))
        ));

        let max_string = "y".repeat(METADATA_MAX_STRING);
        assert!(encode_metadata(&map(&[("", &max_string)])).is_ok());
    }

    #[test]
    fn test_metadata_table_fits_footer_length() {
        let value = "v".repeat(METADATA_MAX_STRING);
        let table = encode_metadata(&map(&[("a", &value)])).unwrap();
        assert_eq!(table.len(), METADATA_MAX_TABLE);

        // each entry is within limits, the table is not
        let half = "v".repeat(120);
        assert!(matches!(
            encode_metadata(&map(&[("a", &half), ("b", &half)])),
            Err(WriteError::MetadataTooLarge(_))
        ));
    }

    #[test]
    fn test_corrupt_metadata() {
        let mut parsed = BTreeMap::new();
        assert!(matches!(
            parse_metadata(b"MD\x01\x05ab", &mut parsed),
            Err(ParseError::CorruptMetadata(_))
        ));
        assert!(matches!(
            parse_metadata(b"MD\x01\xf0", &mut parsed),
            Err(ParseError::CorruptMetadata(_))
        ));
        // not a metadata table at all
        assert!(parse_metadata(b"XX\x01", &mut parsed).is_ok());
        assert!(parsed.is_empty());
    }
}
