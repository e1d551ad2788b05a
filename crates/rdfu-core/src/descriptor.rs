//! DFU functional descriptor, interface mode and device quirks

use std::fmt;

use bitflags::bitflags;

use crate::firmware::{DFU_VERSION_DFUSE, DFU_VERSION_DFU_1_0};

/// bDescriptorType of the DFU functional descriptor
pub const DFU_FUNCTIONAL_DESCRIPTOR_TYPE: u8 = 0x21;

/// Size of the DFU functional descriptor
pub const DFU_FUNCTIONAL_DESCRIPTOR_LEN: usize = 9;

/// Transfer size used when the device reports zero
pub const DEFAULT_TRANSFER_SIZE: u16 = 64;

/// DFU 1.1 bcdDFUVersion
pub const DFU_VERSION_DFU_1_1: u16 = 0x0101;

/// USB interface class for application-specific interfaces
pub const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xfe;

/// Interface subclass for DFU
pub const USB_SUBCLASS_DFU: u8 = 0x01;

bitflags! {
    /// bmAttributes of the functional descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Attributes: u8 {
        /// bitCanDnload
        const CAN_DOWNLOAD = 1 << 0;
        /// bitCanUpload
        const CAN_UPLOAD = 1 << 1;
        /// bitManifestationTolerant
        const MANIFEST_TOL = 1 << 2;
        /// bitWillDetach
        const WILL_DETACH = 1 << 3;
        /// ST extension, accelerated upload
        const CAN_ACCELERATE = 1 << 7;
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Attributes::CAN_DOWNLOAD | Attributes::CAN_UPLOAD
    }
}

bitflags! {
    /// Workarounds for non-conforming devices
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Quirks: u32 {
        /// The poll timeout reported by GETSTATUS is bogus
        const IGNORE_POLLTIMEOUT = 1 << 0;
        /// The device is in DFU mode even though it reports runtime
        const FORCE_DFU_MODE = 1 << 1;
        /// bcdDFUVersion is garbage
        const IGNORE_INVALID_VERSION = 1 << 2;
    }
}

/// Poll timeout used for devices with [`Quirks::IGNORE_POLLTIMEOUT`]
pub const QUIRK_POLL_TIMEOUT_MS: u32 = 5;

impl Quirks {
    /// Look up the quirks of a device by its USB identity
    pub fn for_device(vid: u16, pid: u16, release: u16) -> Self {
        let mut quirks = Quirks::empty();

        match (vid, pid) {
            // Openmoko Freerunner / GTA02
            (0x1d50, 0x5117..=0x5126) | (0x1457, 0x5117..=0x5126) => {
                quirks |= Quirks::IGNORE_POLLTIMEOUT;
            }
            // OpenPCD Reader
            (0x16c0, 0x076b) => quirks |= Quirks::IGNORE_POLLTIMEOUT,
            // Siemens AG, PXM 40 & PXM 50
            (0x0908, 0x02c4) | (0x0908, 0x02c5) if release == 0x0000 => {
                quirks |= Quirks::IGNORE_POLLTIMEOUT;
            }
            // M-Audio Transit
            (0x0763, 0x2806) => quirks |= Quirks::IGNORE_POLLTIMEOUT,
            // NXP LPC
            (0x1fc9, 0x000c) => quirks |= Quirks::FORCE_DFU_MODE,
            // Leaflabs Maple3
            (0x1eaf, 0x0003) if release == 0x0200 => {
                quirks |= Quirks::IGNORE_INVALID_VERSION;
            }
            _ => {}
        }

        quirks
    }
}

/// Whether an interface runs the application or the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Protocol could not be determined
    #[default]
    Unknown,
    /// Runtime (application) mode, protocol 0x01
    Runtime,
    /// DFU (bootloader) mode, protocol 0x02
    Dfu,
}

impl Mode {
    /// Decode bInterfaceProtocol
    pub fn from_protocol(protocol: u8) -> Self {
        match protocol {
            0x01 => Mode::Runtime,
            0x02 => Mode::Dfu,
            _ => Mode::Unknown,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Unknown => "unknown",
            Mode::Runtime => "runtime",
            Mode::Dfu => "dfu",
        };
        f.write_str(s)
    }
}

/// Decoded DFU functional descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    /// bmAttributes
    pub attributes: Attributes,
    /// wDetachTimeOut in milliseconds
    pub detach_timeout: u16,
    /// wTransferSize
    pub transfer_size: u16,
    /// bcdDFUVersion
    pub version: u16,
}

impl Default for FunctionalDescriptor {
    /// Values assumed for devices that have no functional descriptor
    fn default() -> Self {
        Self {
            attributes: Attributes::default(),
            detach_timeout: 0,
            transfer_size: DEFAULT_TRANSFER_SIZE,
            version: DFU_VERSION_DFU_1_0,
        }
    }
}

impl FunctionalDescriptor {
    /// Decode a functional descriptor
    ///
    /// Returns `None` if the buffer is not a DFU functional descriptor.
    /// Some devices ship a 7-byte descriptor without bcdDFUVersion; DFU 1.0
    /// is assumed for those.
    pub fn parse(data: &[u8], quirks: Quirks) -> Option<Self> {
        if data.len() < 7 || data[1] != DFU_FUNCTIONAL_DESCRIPTOR_TYPE {
            return None;
        }

        let mut desc = Self {
            attributes: Attributes::from_bits_truncate(data[2]),
            detach_timeout: u16::from_le_bytes([data[3], data[4]]),
            transfer_size: u16::from_le_bytes([data[5], data[6]]),
            version: if data.len() >= DFU_FUNCTIONAL_DESCRIPTOR_LEN {
                u16::from_le_bytes([data[7], data[8]])
            } else {
                DFU_VERSION_DFU_1_0
            },
        };

        if desc.transfer_size == 0 {
            log::warn!(
                "device reports a transfer size of 0, using {}",
                DEFAULT_TRANSFER_SIZE
            );
            desc.transfer_size = DEFAULT_TRANSFER_SIZE;
        }

        if !quirks.contains(Quirks::IGNORE_INVALID_VERSION)
            && !matches!(
                desc.version,
                DFU_VERSION_DFU_1_0 | DFU_VERSION_DFU_1_1 | DFU_VERSION_DFUSE
            )
        {
            log::warn!("DFU version 0x{:04x} is invalid", desc.version);
        }

        Some(desc)
    }

    /// Whether bcdDFUVersion marks an ST DfuSe interface
    pub fn is_dfuse(&self) -> bool {
        self.version == DFU_VERSION_DFUSE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dfuse() {
        // STM32 system bootloader
        let raw = [0x09, 0x21, 0x0b, 0xff, 0x00, 0x00, 0x08, 0x1a, 0x01];
        let desc = FunctionalDescriptor::parse(&raw, Quirks::empty()).unwrap();
        assert_eq!(
            desc.attributes,
            Attributes::CAN_DOWNLOAD | Attributes::CAN_UPLOAD | Attributes::WILL_DETACH
        );
        assert_eq!(desc.detach_timeout, 0x00ff);
        assert_eq!(desc.transfer_size, 2048);
        assert!(desc.is_dfuse());
    }

    #[test]
    fn test_zero_transfer_size() {
        let raw = [0x09, 0x21, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
        let desc = FunctionalDescriptor::parse(&raw, Quirks::empty()).unwrap();
        assert_eq!(desc.transfer_size, DEFAULT_TRANSFER_SIZE);
        assert!(!desc.is_dfuse());
    }

    #[test]
    fn test_short_descriptor() {
        let raw = [0x07, 0x21, 0x03, 0x10, 0x00, 0x00, 0x04];
        let desc = FunctionalDescriptor::parse(&raw, Quirks::empty()).unwrap();
        assert_eq!(desc.transfer_size, 1024);
        assert_eq!(desc.version, DFU_VERSION_DFU_1_0);
    }

    #[test]
    fn test_not_functional() {
        let raw = [0x09, 0x04, 0x00, 0x00, 0x00, 0xfe, 0x01, 0x02, 0x00];
        assert!(FunctionalDescriptor::parse(&raw, Quirks::empty()).is_none());
        assert!(FunctionalDescriptor::parse(&[0x09, 0x21], Quirks::empty()).is_none());
    }

    #[test]
    fn test_quirks() {
        assert_eq!(
            Quirks::for_device(0x1d50, 0x5119, 0),
            Quirks::IGNORE_POLLTIMEOUT
        );
        assert_eq!(
            Quirks::for_device(0x0908, 0x02c4, 0x0000),
            Quirks::IGNORE_POLLTIMEOUT
        );
        assert!(Quirks::for_device(0x0908, 0x02c4, 0x0001).is_empty());
        assert_eq!(
            Quirks::for_device(0x1fc9, 0x000c, 0x1234),
            Quirks::FORCE_DFU_MODE
        );
        assert_eq!(
            Quirks::for_device(0x1eaf, 0x0003, 0x0200),
            Quirks::IGNORE_INVALID_VERSION
        );
        assert!(Quirks::for_device(0x0483, 0xdf11, 0x2200).is_empty());
    }

    #[test]
    fn test_mode() {
        assert_eq!(Mode::from_protocol(1), Mode::Runtime);
        assert_eq!(Mode::from_protocol(2), Mode::Dfu);
        assert_eq!(Mode::from_protocol(0), Mode::Unknown);
    }
}
