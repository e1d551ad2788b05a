//! List command implementation

use rdfu_core::descriptor::{FunctionalDescriptor, Mode, Quirks};
use rdfu_nusb::NusbConfig;

/// List every connected device with a DFU interface
pub fn run_list(config: &NusbConfig) -> Result<(), Box<dyn std::error::Error>> {
    let devices = rdfu_nusb::list_dfu_devices(config)?;
    if devices.is_empty() {
        println!("No DFU capable USB device found");
        return Ok(());
    }

    for device in devices {
        let quirks = Quirks::for_device(device.ids.vid, device.ids.pid, device.ids.release);
        for info in &device.interfaces {
            let iface = &info.interface;
            let descriptor =
                FunctionalDescriptor::parse(&iface.functional_descriptor, quirks).unwrap_or_default();
            println!(
                "Found {}: [{:04x}:{:04x}] ver={:04x}, bus={}, addr={}, intf={}, alt={}, name=\"{}\", serial=\"{}\", transfer-size={}{}",
                Mode::from_protocol(iface.protocol),
                device.ids.vid,
                device.ids.pid,
                device.ids.release,
                device.bus,
                device.address,
                iface.number,
                iface.alt_setting,
                info.name.as_deref().unwrap_or("UNKNOWN"),
                device.serial.as_deref().unwrap_or("UNKNOWN"),
                descriptor.transfer_size,
                if descriptor.is_dfuse() { ", DfuSe" } else { "" }
            );
        }
    }
    Ok(())
}
