//! Intel-HEX (INHX32) reader and writer
//!
//! Each line is a record `:LLAAAATT[DD..]CC`. Supported record types are
//! data, end-of-file, extended linear address and the vendor symbol table
//! record `0xFE`. Data is collected into elements: holes of up to 1 MiB
//! between records are zero-filled, a larger jump starts a new element.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::{ParseError, WriteError};

use super::{Element, Image};

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXTENDED_LINEAR: u8 = 0x04;
const RECORD_SYMTAB: u8 = 0xfe;

/// Data bytes per record when writing
const BYTES_PER_RECORD: usize = 16;

/// Largest hole between data records that is zero-filled
const MAX_GAP: u64 = 0x10_0000;

/// Result of decoding an Intel-HEX file
#[derive(Debug, Default)]
pub(crate) struct HexContents {
    pub elements: Vec<Element>,
    pub symbols: BTreeMap<String, u64>,
}

struct Record {
    record_type: u8,
    address: u16,
    data: Vec<u8>,
}

fn hex_byte(line: &str, pos: usize, lineno: usize) -> Result<u8, ParseError> {
    line.get(pos..pos + 2)
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or_else(|| ParseError::InvalidHexSyntax {
            line: lineno,
            reason: format!("invalid hex digits at column {}", pos + 1),
        })
}

fn parse_record(line: &str, lineno: usize, check_crc: bool) -> Result<Record, ParseError> {
    if !line.starts_with(':') {
        return Err(ParseError::InvalidHexSyntax {
            line: lineno,
            reason: "record does not start with ':'".into(),
        });
    }
    if line.len() < 11 {
        return Err(ParseError::InvalidHexSyntax {
            line: lineno,
            reason: format!("record too short ({} chars)", line.len()),
        });
    }

    let len = hex_byte(line, 1, lineno)? as usize;
    let expected_chars = 11 + len * 2;
    if line.len() != expected_chars {
        return Err(ParseError::InvalidHexSyntax {
            line: lineno,
            reason: format!(
                "record length 0x{:02x} needs {} chars, got {}",
                len,
                expected_chars,
                line.len()
            ),
        });
    }

    let addr_hi = hex_byte(line, 3, lineno)?;
    let addr_lo = hex_byte(line, 5, lineno)?;
    let record_type = hex_byte(line, 7, lineno)?;
    let mut data = Vec::with_capacity(len);
    for i in 0..len {
        data.push(hex_byte(line, 9 + i * 2, lineno)?);
    }
    let stored = hex_byte(line, 9 + len * 2, lineno)?;

    if check_crc {
        let expected = checksum(len as u8, addr_hi, addr_lo, record_type, &data);
        if expected != stored {
            return Err(ParseError::HexChecksum {
                line: lineno,
                expected,
                actual: stored,
            });
        }
    }

    Ok(Record {
        record_type,
        address: u16::from_be_bytes([addr_hi, addr_lo]),
        data,
    })
}

/// Two's complement of the byte sum from the length field through the data
fn checksum(len: u8, addr_hi: u8, addr_lo: u8, record_type: u8, data: &[u8]) -> u8 {
    let sum = data
        .iter()
        .fold(
            len.wrapping_add(addr_hi)
                .wrapping_add(addr_lo)
                .wrapping_add(record_type),
            |acc, &b| acc.wrapping_add(b),
        );
    sum.wrapping_neg()
}

/// Decode an Intel-HEX file
pub(crate) fn parse(data: &[u8], check_crc: bool) -> Result<HexContents, ParseError> {
    let text = std::str::from_utf8(data).map_err(|e| ParseError::InvalidHexSyntax {
        line: 0,
        reason: format!("not ASCII: {}", e),
    })?;

    let mut elements = Vec::new();
    let mut contents = Vec::new();
    let mut base: Option<u32> = None;
    let mut upper: u32 = 0;
    let mut seen_eof = false;
    let mut symbols = BTreeMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let record = parse_record(line, lineno, check_crc)?;

        match record.record_type {
            RECORD_DATA => {
                let address = upper | record.address as u32;
                let base_addr = *base.get_or_insert(address);
                let end = base_addr as u64 + contents.len() as u64;
                if (address as u64) < end {
                    return Err(ParseError::BadHexAddress {
                        line: lineno,
                        address,
                        reason: "overlaps or precedes earlier data",
                    });
                }
                let gap = address as u64 - end;
                if gap > MAX_GAP {
                    log::debug!("0x{:x} byte hole, new element at 0x{:08x}", gap, address);
                    elements.push(Element::with_address(
                        std::mem::take(&mut contents),
                        base_addr,
                    ));
                    base = Some(address);
                } else if gap > 0 {
                    log::debug!(
                        "filling 0x{:x} byte hole before 0x{:08x} with zeros",
                        gap,
                        address
                    );
                    contents.resize((address - base_addr) as usize, 0);
                }
                contents.extend_from_slice(&record.data);
            }
            RECORD_EOF => {
                if seen_eof {
                    return Err(ParseError::DuplicateEof(lineno));
                }
                seen_eof = true;
            }
            RECORD_EXTENDED_LINEAR => {
                if record.data.len() != 2 {
                    return Err(ParseError::InvalidHexSyntax {
                        line: lineno,
                        reason: "extended linear address record needs 2 bytes".into(),
                    });
                }
                upper = (u16::from_be_bytes([record.data[0], record.data[1]]) as u32) << 16;
            }
            RECORD_SYMTAB => {
                let end = record
                    .data
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(record.data.len());
                let name = String::from_utf8_lossy(&record.data[..end]).into_owned();
                // compiler-generated "$x" markers
                if name.len() == 2 && name.starts_with('$') {
                    continue;
                }
                let address = upper as u64 | record.address as u64;
                log::trace!("symbol {} at 0x{:08x}", name, address);
                symbols.insert(name, address);
            }
            other if seen_eof => {
                log::debug!("ignoring record type 0x{:02x} after EOF", other);
            }
            other => {
                return Err(ParseError::UnknownRecordType {
                    record_type: other,
                    line: lineno,
                });
            }
        }
    }

    if !seen_eof {
        return Err(ParseError::Truncated("no EOF record".into()));
    }

    elements.push(Element::with_address(contents, base.unwrap_or(0)));
    Ok(HexContents { elements, symbols })
}

fn push_record(out: &mut String, record_type: u8, address: u16, data: &[u8]) {
    let [hi, lo] = address.to_be_bytes();
    let _ = write!(out, ":{:02X}{:02X}{:02X}{:02X}", data.len(), hi, lo, record_type);
    for b in data {
        let _ = write!(out, "{:02X}", b);
    }
    let _ = writeln!(
        out,
        "{:02X}",
        checksum(data.len() as u8, hi, lo, record_type, data)
    );
}

/// Encode images as Intel-HEX text
pub(crate) fn write(images: &[Image]) -> Result<Vec<u8>, WriteError> {
    let mut out = String::new();
    let mut upper: u16 = 0;

    for element in images.iter().flat_map(|i| i.elements()) {
        if element.end_address() > u32::MAX as u64 + 1 {
            return Err(WriteError::TooLarge("element"));
        }
        let mut address = element.address();
        let mut remaining = element.contents();
        while !remaining.is_empty() {
            let hi = (address >> 16) as u16;
            if hi != upper {
                push_record(&mut out, RECORD_EXTENDED_LINEAR, 0, &hi.to_be_bytes());
                upper = hi;
            }
            // never let a record cross a 64 KiB boundary
            let to_boundary = 0x1_0000 - (address & 0xffff) as usize;
            let len = remaining.len().min(BYTES_PER_RECORD).min(to_boundary);
            let (chunk, rest) = remaining.split_at(len);
            push_record(&mut out, RECORD_DATA, address as u16, chunk);
            address = address.wrapping_add(len as u32);
            remaining = rest;
        }
    }

    push_record(&mut out, RECORD_EOF, 0, &[]);
    Ok(out.into_bytes())
}
