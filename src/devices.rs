//! Device selection and dispatch
//!
//! The `--device` string picks the transport:
//!
//! - `dummy` or `dummy:type=dfuse` - in-memory emulator
//! - `VID:PID` - first USB device with these IDs
//! - `key=value,...` - USB device options (see `rdfu_nusb::parse_options`)
//! - nothing - the only connected DFU device

use std::time::Duration;

use rdfu_core::target::{OpenFlags, TargetConfig};
use rdfu_core::{DfuDevice, DfuTransport};
use rdfu_dummy::{DummyConfig, DummyDfu};
use rdfu_nusb::{NusbConfig, NusbTransport};

use crate::cli::DeviceArgs;

/// A parsed `--device` selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector<'a> {
    /// In-memory emulator with its options
    Dummy(Vec<(&'a str, &'a str)>),
    /// Real USB device
    Usb(Vec<(&'a str, &'a str)>),
}

/// Split a device string into a selector
pub fn parse_device_string(s: &str) -> Result<Selector<'_>, String> {
    if let Some(rest) = s.strip_prefix("dummy") {
        let options = match rest.strip_prefix(':') {
            Some(opts) => parse_option_list(opts),
            None if rest.is_empty() => Vec::new(),
            None => return Err(format!("Unknown device: {}", s)),
        };
        return Ok(Selector::Dummy(options));
    }
    if s.contains('=') || s.is_empty() {
        return Ok(Selector::Usb(parse_option_list(s)));
    }
    match s.split_once(':') {
        Some((vid, pid)) => Ok(Selector::Usb(vec![("vid", vid), ("pid", pid)])),
        None => Err(format!(
            "Invalid device '{}', expected VID:PID, dummy or key=value options",
            s
        )),
    }
}

fn parse_option_list(s: &str) -> Vec<(&str, &str)> {
    s.split(',')
        .filter_map(|opt| opt.split_once('='))
        .collect()
}

fn parse_id(key: &str, value: &str) -> Result<u16, String> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|_| format!("Invalid {} value: {}", key, value))
}

fn dummy_config(options: &[(&str, &str)]) -> Result<DummyConfig, Box<dyn std::error::Error>> {
    let mut config = match options.iter().find(|(k, _)| *k == "type") {
        None | Some((_, "dfu")) => DummyConfig::default(),
        Some((_, "dfuse")) => DummyConfig::dfuse(),
        Some((_, other)) => return Err(format!("Unknown dummy type: {}", other).into()),
    };
    for (key, value) in options {
        match *key {
            "type" => {}
            "vid" => config.vid = parse_id(key, value)?,
            "pid" => config.pid = parse_id(key, value)?,
            "runtime" => config.runtime = *value == "1" || *value == "true",
            _ => log::warn!("Unknown dummy option: {}={}", key, value),
        }
    }
    Ok(config)
}

fn apply_overrides(config: &mut TargetConfig, args: &DeviceArgs) {
    if let Some(ms) = args.timeout {
        config.timeout = Duration::from_millis(ms);
    }
    if args.transfer_size.is_some() {
        config.transfer_size_override = args.transfer_size;
    }
}

/// Open the selected device and hand it to `f`
pub fn with_device<F>(args: &DeviceArgs, f: F) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(&mut DfuDevice<&mut dyn DfuTransport>) -> Result<(), Box<dyn std::error::Error>>,
{
    match parse_device_string(args.device.as_deref().unwrap_or(""))? {
        Selector::Dummy(options) => {
            let mut dummy = DummyDfu::new(dummy_config(&options)?);
            let mut config = TargetConfig::default();
            apply_overrides(&mut config, args);
            let mut device = DfuDevice::new(&mut dummy as &mut dyn DfuTransport, config)?;
            f(&mut device)
        }
        Selector::Usb(options) => {
            let nusb_config = rdfu_nusb::parse_options(&options)?;
            let mut transport = NusbTransport::open(&nusb_config).map_err(|e| {
                format!(
                    "{}\nMake sure the device is connected and you have permissions.",
                    e
                )
            })?;
            let mut config = nusb_config.target_config();
            apply_overrides(&mut config, args);
            let mut device = DfuDevice::new(&mut transport as &mut dyn DfuTransport, config)?;
            f(&mut device)
        }
    }
}

/// Resolve `--alt` to an alternate setting number
///
/// Names are matched against the opened targets.
pub fn resolve_alt<T: DfuTransport>(
    device: &mut DfuDevice<T>,
    alt: &str,
) -> Result<u8, Box<dyn std::error::Error>> {
    if let Ok(number) = alt.parse::<u8>() {
        device.target_by_alt_setting(number)?;
        return Ok(number);
    }
    device.open(OpenFlags::NO_AUTO_REFRESH)?;
    Ok(device.target_by_name(alt)?.alt_setting())
}

/// USB filter used by `list`
pub fn list_config(args: &DeviceArgs) -> Result<NusbConfig, Box<dyn std::error::Error>> {
    match parse_device_string(args.device.as_deref().unwrap_or(""))? {
        Selector::Usb(options) => Ok(rdfu_nusb::parse_options(&options)?),
        Selector::Dummy(_) => Err("the dummy device is not listed, use it directly".into()),
    }
}
