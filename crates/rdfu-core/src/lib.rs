//! rdfu-core - Core library for USB DFU and ST DfuSe
//!
//! This crate provides everything needed to move firmware between a host
//! and a device running a DFU bootloader, independent of the USB stack:
//!
//! - `firmware` - parse and write raw, DFU 1.0, DfuSe and Intel-HEX files,
//!   including the DFU footer, the metadata table and CRC32
//! - `sector` - decode the DfuSe alternate-setting descriptor string into a
//!   typed map of erase/read/write regions
//! - `target` / `transfer` - drive the DFU and DfuSe request set to
//!   download, upload and verify images
//! - `device` - a multi-target façade matching firmware images to targets
//!
//! USB access goes through the [`DfuTransport`] trait; `rdfu-nusb` provides
//! the real implementation and `rdfu-dummy` an in-memory emulator.
//!
//! # Example
//!
//! ```no_run
//! use rdfu_core::firmware::{Firmware, ParseFlags};
//! use rdfu_core::target::OpenFlags;
//! use rdfu_core::transfer::{NoProgress, TransferFlags};
//! use rdfu_core::{DfuDevice, DfuTransport};
//!
//! fn flash<T: DfuTransport>(usb: T, data: &[u8]) -> rdfu_core::Result<()> {
//!     let firmware = Firmware::parse(data, ParseFlags::empty())?;
//!     let mut device = DfuDevice::new(usb, Default::default())?;
//!     device.open(OpenFlags::empty())?;
//!     device.download(&firmware, TransferFlags::VERIFY, &mut NoProgress)
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod crc;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod firmware;
pub mod protocol;
pub mod sector;
pub mod target;
pub mod transfer;
pub mod transport;

pub use device::DfuDevice;
pub use error::{Error, ErrorKind, Result};
pub use target::DfuTarget;
pub use transport::{DfuTransport, TransportError};
