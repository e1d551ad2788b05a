//! Device transfer commands

use std::path::Path;

use rdfu_core::descriptor::Mode;
use rdfu_core::firmware::{Firmware, Format};
use rdfu_core::target::OpenFlags;
use rdfu_core::transfer::{self, TransferFlags, REPLUG_TIMEOUT};
use rdfu_core::{DfuDevice, DfuTransport, TransportError};

use super::file::{save_firmware, set_load_address};
use super::progress::IndicatifProgress;
use crate::devices::resolve_alt;

fn check_dfu_mode<T: DfuTransport>(device: &DfuDevice<T>) -> Result<(), Box<dyn std::error::Error>> {
    if device.targets().iter().any(|t| t.mode() == Mode::Runtime) {
        return Err("Device is in runtime mode, run 'rdfu detach' first".into());
    }
    Ok(())
}

/// Options for the download command
#[derive(Debug, Default)]
pub struct DownloadOptions {
    /// Alternate setting number or name
    pub alt: Option<String>,
    /// Load address for a single-element file
    pub address: Option<u32>,
    pub flags: TransferFlags,
}

/// Run the download command
pub fn run_download<T: DfuTransport>(
    device: &mut DfuDevice<T>,
    mut firmware: Firmware,
    options: &DownloadOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    check_dfu_mode(device)?;
    if let Some(address) = options.address {
        set_load_address(&mut firmware, address)?;
    }

    device.open(OpenFlags::empty())?;
    if let Some(alt) = &options.alt {
        let alt = resolve_alt(device, alt)?;
        let images = firmware.images_mut();
        if let [image] = images.as_mut_slice() {
            image.set_alt_setting(alt);
        } else {
            images.retain(|image| image.alt_setting() == alt);
            if images.is_empty() {
                return Err(format!("Firmware has no image for alt setting {}", alt).into());
            }
        }
    }

    println!(
        "Downloading {} bytes in {} image(s) to {:04x}:{:04x}",
        firmware.size(),
        firmware.images().len(),
        device.usb_ids().vid,
        device.usb_ids().pid
    );
    let mut progress = IndicatifProgress::new();
    device.download(&firmware, options.flags, &mut progress)?;
    println!("Download done");
    Ok(())
}

/// Run the upload command
pub fn run_upload<T: DfuTransport>(
    device: &mut DfuDevice<T>,
    output: &Path,
    alt: Option<&str>,
    size: Option<u32>,
    format: Option<Format>,
    flags: TransferFlags,
) -> Result<(), Box<dyn std::error::Error>> {
    check_dfu_mode(device)?;
    device.open(OpenFlags::empty())?;

    let mut progress = IndicatifProgress::new();
    let mut firmware = match alt {
        Some(alt) => {
            let alt = resolve_alt(device, alt)?;
            let ids = device.usb_ids();
            let (usb, target) = device.split(alt)?;
            let format = if target.is_dfuse() {
                Format::DfuSe
            } else {
                Format::Dfu1_0
            };
            let expected_size = size.unwrap_or(0) as usize;
            let image = transfer::upload(usb, target, expected_size, flags, &mut progress)?;

            let mut firmware = Firmware::from_image(image, format);
            firmware.set_vid(ids.vid);
            firmware.set_pid(ids.pid);
            firmware.set_release(ids.release);
            firmware
        }
        None => {
            if size.is_some() {
                log::warn!("--size needs --alt, uploading everything");
            }
            device.upload(flags, &mut progress)?
        }
    };

    if let Some(format) = format {
        firmware.set_format(format);
    }
    println!("Uploaded {} bytes", firmware.size());
    save_firmware(&firmware, output)
}

/// Run the detach command
pub fn run_detach<T: DfuTransport>(
    device: &mut DfuDevice<T>,
) -> Result<(), Box<dyn std::error::Error>> {
    if !device.targets().iter().any(|t| t.mode() == Mode::Runtime) {
        println!("Device is already in DFU mode");
        return Ok(());
    }
    device.detach()?;
    match device.transport_mut().wait_for_replug(REPLUG_TIMEOUT) {
        Ok(()) => println!("Device re-enumerated in DFU mode"),
        Err(TransportError::NotSupported) => println!("Detach request sent"),
        Err(e) => log::warn!("Device did not re-enumerate: {}", e),
    }
    Ok(())
}

/// Run the attach command
pub fn run_attach<T: DfuTransport>(
    device: &mut DfuDevice<T>,
) -> Result<(), Box<dyn std::error::Error>> {
    device.attach()?;
    println!("Device left DFU mode");
    Ok(())
}
