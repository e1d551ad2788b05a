//! ST DfuSe multi-image container (UM0391)
//!
//! ```text
//! prefix   "DfuSe" | ver:u8=1 | image_size:u32 | targets:u8
//! target   "Target" | alt:u8 | named:u32 | name:[u8;255] | size:u32 | elements:u32
//! element  address:u32 | size:u32 | data
//! ```
//!
//! All multi-byte fields are little-endian. `image_size` covers the prefix
//! and every target; the DFU footer follows.

use crate::error::{ParseError, WriteError};

use super::{Element, Image};

/// DfuSe prefix signature
pub const DFUSE_SIGNATURE: &[u8; 5] = b"DfuSe";
/// Only known DfuSe prefix version
pub const DFUSE_VERSION: u8 = 0x01;
/// Size of the DfuSe prefix
pub const DFUSE_PREFIX_LEN: usize = 11;

const TARGET_SIGNATURE: &[u8; 6] = b"Target";
const TARGET_NAME_LEN: usize = 255;
const TARGET_PREFIX_LEN: usize = 6 + 1 + 4 + TARGET_NAME_LEN + 4 + 4;
const ELEMENT_PREFIX_LEN: usize = 8;

/// Little-endian cursor over a byte slice
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8], ParseError> {
        if self.remaining() < len {
            return Err(ParseError::BadDfuSeImage(format!(
                "{} needs 0x{:x} bytes at offset 0x{:x}, only 0x{:x} left",
                what,
                len,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self, what: &str) -> Result<u8, ParseError> {
        Ok(self.bytes(1, what)?[0])
    }

    fn u32(&mut self, what: &str) -> Result<u32, ParseError> {
        let b = self.bytes(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Decode a DfuSe payload (without DFU footer) into images
pub(crate) fn parse(payload: &[u8]) -> Result<Vec<Image>, ParseError> {
    if payload.len() < DFUSE_PREFIX_LEN {
        return Err(ParseError::BadDfuSePrefix(format!(
            "payload is only 0x{:x} bytes",
            payload.len()
        )));
    }
    if &payload[0..5] != DFUSE_SIGNATURE {
        return Err(ParseError::BadDfuSePrefix("invalid signature".into()));
    }
    if payload[5] != DFUSE_VERSION {
        return Err(ParseError::BadDfuSePrefix(format!(
            "version 0x{:02x} unsupported",
            payload[5]
        )));
    }
    let image_size = u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]);
    if image_size as usize != payload.len() {
        return Err(ParseError::BadDfuSePrefix(format!(
            "image size 0x{:x} does not match payload size 0x{:x}",
            image_size,
            payload.len()
        )));
    }
    let target_count = payload[10];

    let mut reader = Reader::new(&payload[DFUSE_PREFIX_LEN..]);
    let mut images = Vec::with_capacity(target_count as usize);
    for idx in 0..target_count {
        let image = parse_target(&mut reader).map_err(|e| match e {
            ParseError::BadDfuSeImage(msg) => {
                ParseError::BadDfuSeImage(format!("target {}: {}", idx, msg))
            }
            other => other,
        })?;
        images.push(image);
    }
    if reader.remaining() != 0 {
        return Err(ParseError::BadDfuSeImage(format!(
            "0x{:x} trailing bytes after last target",
            reader.remaining()
        )));
    }
    Ok(images)
}

fn parse_target(reader: &mut Reader<'_>) -> Result<Image, ParseError> {
    if reader.bytes(6, "signature")? != TARGET_SIGNATURE {
        return Err(ParseError::BadDfuSeImage("invalid target signature".into()));
    }
    let mut image = Image::new();
    image.set_alt_setting(reader.u8("alt setting")?);
    let named = reader.u32("name flag")?;
    let name = reader.bytes(TARGET_NAME_LEN, "name")?;
    if named != 0 {
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        image.set_name(Some(&String::from_utf8_lossy(&name[..end])));
    }
    let target_size = reader.u32("target size")? as usize;
    let element_count = reader.u32("element count")?;

    let start = reader.pos;
    for _ in 0..element_count {
        let address = reader.u32("element address")?;
        let size = reader.u32("element size")? as usize;
        let data = reader.bytes(size, "element data")?;
        image.add_element(Element::with_address(data.to_vec(), address));
    }
    let consumed = reader.pos - start;
    if consumed != target_size {
        return Err(ParseError::BadDfuSeImage(format!(
            "target size 0x{:x} does not match elements 0x{:x}",
            target_size, consumed
        )));
    }
    Ok(image)
}

fn write_target(out: &mut Vec<u8>, image: &Image) -> Result<(), WriteError> {
    let target_size: usize = image
        .elements()
        .iter()
        .map(|e| ELEMENT_PREFIX_LEN + e.len())
        .sum();
    let target_size = u32::try_from(target_size).map_err(|_| WriteError::TooLarge("target"))?;

    out.extend_from_slice(TARGET_SIGNATURE);
    out.push(image.alt_setting());
    let mut name = [0u8; TARGET_NAME_LEN];
    match image.name() {
        Some(n) => {
            out.extend_from_slice(&1u32.to_le_bytes());
            // Image names are capped below the field size so a NUL always fits
            name[..n.len()].copy_from_slice(n.as_bytes());
        }
        None => out.extend_from_slice(&0u32.to_le_bytes()),
    }
    out.extend_from_slice(&name);
    out.extend_from_slice(&target_size.to_le_bytes());
    out.extend_from_slice(&(image.elements().len() as u32).to_le_bytes());

    for element in image.elements() {
        let size = u32::try_from(element.len()).map_err(|_| WriteError::TooLarge("element"))?;
        out.extend_from_slice(&element.address().to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(element.contents());
    }
    Ok(())
}

/// Encode images as a DfuSe payload (without DFU footer)
pub(crate) fn write(images: &[Image]) -> Result<Vec<u8>, WriteError> {
    let target_count =
        u8::try_from(images.len()).map_err(|_| WriteError::TooManyImages {
            format: "DfuSe",
            count: images.len(),
        })?;

    let body_len: usize = images
        .iter()
        .map(|i| TARGET_PREFIX_LEN + i.elements().len() * ELEMENT_PREFIX_LEN + i.size())
        .sum();
    let mut out = Vec::with_capacity(DFUSE_PREFIX_LEN + body_len);
    out.extend_from_slice(DFUSE_SIGNATURE);
    out.push(DFUSE_VERSION);
    out.extend_from_slice(&[0u8; 4]);
    out.push(target_count);

    for image in images {
        write_target(&mut out, image)?;
    }

    let image_size = u32::try_from(out.len()).map_err(|_| WriteError::TooLarge("image"))?;
    out[6..10].copy_from_slice(&image_size.to_le_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_images() -> Vec<Image> {
        let mut flash = Image::new();
        flash.set_name(Some("Internal Flash"));
        flash.add_element(Element::with_address(vec![0x11; 32], 0x0800_0000));
        flash.add_element(Element::with_address(vec![0x22; 5], 0x0800_4000));

        let mut option = Image::new();
        option.set_alt_setting(1);
        option.add_element(Element::with_address(vec![0xaa, 0x55], 0x1fff_c000));
        vec![flash, option]
    }

    #[test]
    fn test_layout() {
        let out = write(&two_images()).unwrap();
        assert_eq!(&out[0..6], b"DfuSe\x01");
        assert_eq!(
            u32::from_le_bytes([out[6], out[7], out[8], out[9]]) as usize,
            out.len()
        );
        assert_eq!(out[10], 2);
        assert_eq!(&out[11..17], b"Target");
        assert_eq!(out[17], 0);
        assert_eq!(&out[18..22], &[1, 0, 0, 0]);
        assert_eq!(&out[22..36], b"Internal Flash");
        assert_eq!(out[36], 0);
        // first element prefix directly after the 274-byte target prefix
        let e = 11 + TARGET_PREFIX_LEN;
        assert_eq!(&out[e..e + 8], &[0, 0, 0, 8, 32, 0, 0, 0]);
    }

    #[test]
    fn test_roundtrip() {
        let images = two_images();
        let parsed = parse(&write(&images).unwrap()).unwrap();
        assert_eq!(parsed, images);
    }

    #[test]
    fn test_bad_prefix() {
        let mut out = write(&two_images()).unwrap();
        out[5] = 2;
        assert!(matches!(parse(&out), Err(ParseError::BadDfuSePrefix(_))));

        let mut out = write(&two_images()).unwrap();
        out.push(0);
        assert!(matches!(parse(&out), Err(ParseError::BadDfuSePrefix(_))));

        assert!(matches!(
            parse(b"DfuSf\x01\x0b\x00\x00\x00\x00"),
            Err(ParseError::BadDfuSePrefix(_))
        ));
    }

    #[test]
    fn test_truncated_target() {
        // prefix claims one target but none follows
        let out = b"DfuSe\x01\x0b\x00\x00\x00\x01";
        assert!(matches!(parse(out), Err(ParseError::BadDfuSeImage(_))));
    }
}
