//! Firmware containers
//!
//! A [`Firmware`] is an ordered list of [`Image`]s, each of which is an
//! ordered list of [`Element`]s, plus the USB identity and metadata carried
//! by the DFU file suffix. It can be read from and written to:
//!
//! - raw binary (a single element at address 0)
//! - DFU 1.0 (raw payload plus the 16-byte suffix)
//! - ST DfuSe (multi-image payload plus the suffix)
//! - Intel-HEX
//!
//! ```ignore
//! let fw = Firmware::parse(&std::fs::read("app.dfu")?, ParseFlags::empty())?;
//! println!("{}", fw);
//! ```

mod dfuse;
mod element;
mod footer;
mod ihex;
mod image;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::crc::crc32;
use crate::error::{ParseError, WriteError};

pub use element::Element;
pub use footer::{Footer, FOOTER_LEN, METADATA_MAX_ENTRIES, METADATA_MAX_STRING};
pub use image::{Image, IMAGE_NAME_MAX};

/// Value of vid/pid/release meaning "not set"
pub const ID_UNSET: u16 = 0xffff;

/// bcdDFU of a plain DFU 1.0 file suffix
pub const DFU_VERSION_DFU_1_0: u16 = 0x0100;
/// bcdDFU of an ST DfuSe file suffix
pub const DFU_VERSION_DFUSE: u16 = 0x011a;

/// Metadata key carrying the cipher kind
pub const METADATA_CIPHER_KIND: &str = "CipherKind";

bitflags! {
    /// Options for [`Firmware::parse`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParseFlags: u8 {
        /// Do not verify the footer CRC or Intel-HEX record checksums
        const NO_CRC_TEST = 1 << 0;
        /// Accept any footer bcdDFU value
        const NO_VERSION_TEST = 1 << 1;
        /// Do not decode the metadata table
        const NO_METADATA = 1 << 2;
    }
}

/// On-disk container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Raw binary, no suffix
    #[default]
    Raw,
    /// DFU 1.0 suffix
    Dfu1_0,
    /// ST DfuSe multi-image container
    DfuSe,
    /// Intel-HEX text
    IntelHex,
    /// ELF object (read-only identification)
    Elf,
}

impl Format {
    /// Format implied by a footer bcdDFU value
    pub fn from_version(version: u16) -> Option<Self> {
        match version {
            DFU_VERSION_DFU_1_0 => Some(Format::Dfu1_0),
            DFU_VERSION_DFUSE => Some(Format::DfuSe),
            _ => None,
        }
    }

    /// bcdDFU value written into the footer
    pub fn version(self) -> Option<u16> {
        match self {
            Format::Dfu1_0 => Some(DFU_VERSION_DFU_1_0),
            Format::DfuSe => Some(DFU_VERSION_DFUSE),
            _ => None,
        }
    }

    /// Short identifier, the inverse of [`FromStr`]
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Raw => "raw",
            Format::Dfu1_0 => "dfu",
            Format::DfuSe => "dfuse",
            Format::IntelHex => "ihex",
            Format::Elf => "elf",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "bin" => Ok(Format::Raw),
            "dfu" | "dfu-1.0" => Ok(Format::Dfu1_0),
            "dfuse" => Ok(Format::DfuSe),
            "ihex" | "hex" => Ok(Format::IntelHex),
            "elf" => Ok(Format::Elf),
            _ => Err(format!(
                "unknown format '{}', expected raw, dfu, dfuse, ihex or elf",
                s
            )),
        }
    }
}

/// At-rest obfuscation applied to the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherKind {
    /// Plain payload
    #[default]
    None,
    /// XTEA encrypted payload
    Xtea,
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherKind::None => f.write_str("none"),
            CipherKind::Xtea => f.write_str("xtea"),
        }
    }
}

/// A firmware file: images plus USB identity and metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    images: Vec<Image>,
    vid: u16,
    pid: u16,
    release: u16,
    format: Format,
    cipher_kind: CipherKind,
    metadata: BTreeMap<String, String>,
    symbols: BTreeMap<String, u64>,
}

impl Default for Firmware {
    fn default() -> Self {
        Self {
            images: Vec::new(),
            vid: ID_UNSET,
            pid: ID_UNSET,
            release: ID_UNSET,
            format: Format::Raw,
            cipher_kind: CipherKind::None,
            metadata: BTreeMap::new(),
            symbols: BTreeMap::new(),
        }
    }
}

impl Firmware {
    /// Create an empty raw firmware with unset identity
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a firmware holding a single image
    pub fn from_image(image: Image, format: Format) -> Self {
        Self {
            images: vec![image],
            format,
            ..Self::default()
        }
    }

    /// Decode a firmware file
    ///
    /// Intel-HEX is detected by a leading `':'`. Otherwise a valid DFU
    /// suffix selects DFU 1.0 or DfuSe, and anything else is raw binary.
    pub fn parse(data: &[u8], flags: ParseFlags) -> Result<Self, ParseError> {
        if data.first() == Some(&b':') {
            let hex = ihex::parse(data, !flags.contains(ParseFlags::NO_CRC_TEST))?;
            let mut image = Image::new();
            for element in hex.elements {
                image.add_element(element);
            }
            let mut fw = Self::from_image(image, Format::IntelHex);
            fw.symbols = hex.symbols;
            return Ok(fw);
        }

        let footer = match Footer::parse(data) {
            Some(footer) => footer,
            None => {
                log::debug!("no DFU suffix, treating 0x{:x} bytes as raw", data.len());
                return Ok(Self::from_image(
                    Image::from_element(Element::new(data.to_vec())),
                    Format::Raw,
                ));
            }
        };

        let format = match Format::from_version(footer.version) {
            Some(format) => format,
            None if flags.contains(ParseFlags::NO_VERSION_TEST) => {
                log::warn!(
                    "ignoring unknown DFU version 0x{:04x}, assuming DFU 1.0",
                    footer.version
                );
                Format::Dfu1_0
            }
            None => return Err(ParseError::BadVersion(footer.version)),
        };

        let (payload_end, metadata_end) =
            footer::validate(data, &footer, !flags.contains(ParseFlags::NO_CRC_TEST))?;

        let mut fw = Self {
            vid: footer.vid,
            pid: footer.pid,
            release: footer.release,
            format,
            ..Self::default()
        };

        if !flags.contains(ParseFlags::NO_METADATA) {
            footer::parse_metadata(&data[payload_end..metadata_end], &mut fw.metadata)?;
            if fw.metadata.get(METADATA_CIPHER_KIND).map(String::as_str) == Some("XTEA") {
                fw.cipher_kind = CipherKind::Xtea;
            }
        }

        let payload = &data[..payload_end];
        match format {
            Format::DfuSe => fw.images = dfuse::parse(payload)?,
            _ => {
                fw.images
                    .push(Image::from_element(Element::new(payload.to_vec())));
            }
        }
        Ok(fw)
    }

    /// Encode the firmware in its [`format`](Self::format)
    pub fn write(&self) -> Result<Vec<u8>, WriteError> {
        match self.format {
            Format::Raw => Ok(self.single_element("raw")?.contents().to_vec()),
            Format::Dfu1_0 => {
                let payload = self.single_element("DFU 1.0")?.contents().to_vec();
                self.append_footer(payload, DFU_VERSION_DFU_1_0)
            }
            Format::DfuSe => {
                if self.images.is_empty() {
                    return Err(WriteError::WrongElementCount(
                        "no images to write".into(),
                    ));
                }
                let payload = dfuse::write(&self.images)?;
                self.append_footer(payload, DFU_VERSION_DFUSE)
            }
            Format::IntelHex => {
                if self.images.is_empty() {
                    return Err(WriteError::WrongElementCount(
                        "no images to write".into(),
                    ));
                }
                ihex::write(&self.images)
            }
            Format::Elf => Err(WriteError::UnsupportedFormat("ELF")),
        }
    }

    fn single_element(&self, format: &'static str) -> Result<&Element, WriteError> {
        match self.images.as_slice() {
            [] => Err(WriteError::WrongElementCount("no images to write".into())),
            [image] => match image.elements() {
                [element] => Ok(element),
                other => Err(WriteError::WrongElementCount(format!(
                    "{} needs exactly one element, got {}",
                    format,
                    other.len()
                ))),
            },
            images => Err(WriteError::TooManyImages {
                format,
                count: images.len(),
            }),
        }
    }

    fn append_footer(&self, payload: Vec<u8>, version: u16) -> Result<Vec<u8>, WriteError> {
        let mut metadata = self.metadata.clone();
        match self.cipher_kind {
            CipherKind::Xtea => {
                metadata.insert(METADATA_CIPHER_KIND.to_string(), "XTEA".to_string());
            }
            CipherKind::None => {}
        }
        footer::append(
            payload,
            &metadata,
            self.vid,
            self.pid,
            self.release,
            version,
        )
    }

    /// All images in order
    pub fn images(&self) -> &[Image] {
        &self.images
    }

    /// Mutable access to the images
    pub fn images_mut(&mut self) -> &mut Vec<Image> {
        &mut self.images
    }

    /// Append an image
    pub fn add_image(&mut self, image: Image) {
        self.images.push(image);
    }

    /// First image targeting an alternate setting
    pub fn image_by_alt_setting(&self, alt_setting: u8) -> Option<&Image> {
        self.images.iter().find(|i| i.alt_setting() == alt_setting)
    }

    /// First image with a given name
    pub fn image_by_name(&self, name: &str) -> Option<&Image> {
        self.images.iter().find(|i| i.name() == Some(name))
    }

    /// Total payload size over all images
    pub fn size(&self) -> usize {
        self.images.iter().map(Image::size).sum()
    }

    /// USB vendor ID, [`ID_UNSET`] if not set
    pub fn vid(&self) -> u16 {
        self.vid
    }

    /// Set the USB vendor ID
    pub fn set_vid(&mut self, vid: u16) {
        self.vid = vid;
    }

    /// USB product ID, [`ID_UNSET`] if not set
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// Set the USB product ID
    pub fn set_pid(&mut self, pid: u16) {
        self.pid = pid;
    }

    /// Device release (bcdDevice), [`ID_UNSET`] if not set
    pub fn release(&self) -> u16 {
        self.release
    }

    /// Set the device release
    pub fn set_release(&mut self, release: u16) {
        self.release = release;
    }

    /// Container format used by [`write`](Self::write)
    pub fn format(&self) -> Format {
        self.format
    }

    /// Set the container format
    pub fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    /// Payload cipher
    pub fn cipher_kind(&self) -> CipherKind {
        self.cipher_kind
    }

    /// Set the payload cipher
    pub fn set_cipher_kind(&mut self, cipher_kind: CipherKind) {
        self.cipher_kind = cipher_kind;
    }

    /// Metadata key/value pairs
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Look up one metadata value
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Insert or replace a metadata value
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Remove a metadata value
    pub fn remove_metadata(&mut self, key: &str) -> Option<String> {
        self.metadata.remove(key)
    }

    /// Named addresses recorded from Intel-HEX symbol records
    pub fn symbols(&self) -> &BTreeMap<String, u64> {
        &self.symbols
    }

    /// Address of a named symbol
    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    /// Record a named address
    pub fn add_symbol(&mut self, name: impl Into<String>, address: u64) {
        self.symbols.insert(name.into(), address);
    }
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "vid:         0x{:04x}", self.vid)?;
        writeln!(f, "pid:         0x{:04x}", self.pid)?;
        writeln!(f, "release:     0x{:04x}", self.release)?;
        writeln!(f, "format:      {}", self.format)?;
        writeln!(f, "cipher:      {}", self.cipher_kind)?;
        for (key, value) in &self.metadata {
            writeln!(f, "metadata:    {}={}", key, value)?;
        }
        for (name, address) in &self.symbols {
            writeln!(f, "symbol:      {}=0x{:08x}", name, address)?;
        }
        for (idx, image) in self.images.iter().enumerate() {
            writeln!(f, "image {}:", idx)?;
            writeln!(f, "  alt:       {}", image.alt_setting())?;
            if let Some(name) = image.name() {
                writeln!(f, "  name:      {}", name)?;
            }
            writeln!(f, "  elements:  {}", image.elements().len())?;
            for (eidx, element) in image.elements().iter().enumerate() {
                writeln!(f, "  element {}:", eidx)?;
                writeln!(f, "    address: 0x{:08x}", element.address())?;
                if element.target_size() > 0 {
                    writeln!(f, "    target:  0x{:x}", element.target_size())?;
                }
                writeln!(f, "    size:    0x{:x}", element.len())?;
                writeln!(f, "    crc:     0x{:08x}", crc32(element.contents()))?;
            }
        }
        Ok(())
    }
}
