//! rdfu-nusb - USB transport for rdfu
//!
//! Implements [`rdfu_core::DfuTransport`] on top of [`nusb`]: class control
//! transfers to the DFU interface, enumeration of DFU alternate settings
//! (class 0xfe, subclass 0x01) with their functional descriptors, string
//! descriptors, host-side reset and waiting for a device to re-enumerate.
//!
//! # Example
//!
//! ```no_run
//! use rdfu_core::target::OpenFlags;
//! use rdfu_core::DfuDevice;
//! use rdfu_nusb::{NusbConfig, NusbTransport};
//!
//! let config = NusbConfig::with_ids(0x0483, 0xdf11);
//! let transport = NusbTransport::open(&config)?;
//! let mut device = DfuDevice::new(transport, config.target_config())?;
//! device.open(OpenFlags::empty())?;
//! for target in device.targets() {
//!     println!("alt {}: {:?}", target.alt_setting(), target.name());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Device Options
//!
//! When using the CLI, the following `key=value` options select the device:
//!
//! - `vid=<hex>` / `pid=<hex>` - USB vendor and product ID
//! - `serial=<string>` - serial number
//! - `bus=<n>` / `address=<n>` - bus number and device address
//! - `timeout=<ms>` - control transfer timeout
//! - `transfer-size=<n>` - override wTransferSize

mod device;
mod error;

use std::time::Duration;

pub use device::{list_dfu_devices, DfuInterfaceInfo, NusbConfig, NusbDeviceInfo, NusbTransport};
pub use error::{NusbError, Result};

fn parse_hex_u16(key: &str, value: &str) -> Result<u16> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u16::from_str_radix(digits, 16)
        .map_err(|_| NusbError::InvalidParameter(format!("Invalid {} value: {}", key, value)))
}

fn parse_decimal<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| NusbError::InvalidParameter(format!("Invalid {} value: {}", key, value)))
}

/// Parse `key=value` device options into a [`NusbConfig`]
pub fn parse_options(options: &[(&str, &str)]) -> Result<NusbConfig> {
    let mut config = NusbConfig::default();

    for (key, value) in options {
        match *key {
            "vid" => config.vid = Some(parse_hex_u16(key, value)?),
            "pid" => config.pid = Some(parse_hex_u16(key, value)?),
            "serial" => config.serial = Some(value.to_string()),
            "bus" => config.bus = Some(parse_decimal(key, value)?),
            "address" => config.address = Some(parse_decimal(key, value)?),
            "timeout" => {
                let ms: u64 = parse_decimal(key, value)?;
                config.timeout = Some(Duration::from_millis(ms));
                log::debug!("Setting control transfer timeout to {} ms", ms);
            }
            "transfer-size" => {
                let size: u16 = parse_decimal(key, value)?;
                if size == 0 {
                    return Err(NusbError::InvalidParameter(
                        "transfer-size must not be 0".into(),
                    ));
                }
                config.transfer_size = Some(size);
            }
            _ => {
                log::warn!("Unknown USB device option: {}={}", key, value);
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let config = parse_options(&[
            ("vid", "0483"),
            ("pid", "0xDF11"),
            ("serial", "3671"),
            ("bus", "3"),
            ("address", "17"),
            ("timeout", "250"),
            ("transfer-size", "2048"),
        ])
        .unwrap();
        assert_eq!(config.vid, Some(0x0483));
        assert_eq!(config.pid, Some(0xdf11));
        assert_eq!(config.serial.as_deref(), Some("3671"));
        assert_eq!(config.bus, Some(3));
        assert_eq!(config.address, Some(17));
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.transfer_size, Some(2048));

        let target = config.target_config();
        assert_eq!(target.timeout, Duration::from_millis(250));
        assert_eq!(target.transfer_size_override, Some(2048));
    }

    #[test]
    fn test_parse_options_defaults() {
        let config = parse_options(&[("unknown", "1")]).unwrap();
        assert_eq!(config, NusbConfig::default());
        let target = config.target_config();
        assert_eq!(target.transfer_size_override, None);
    }

    #[test]
    fn test_parse_options_invalid() {
        assert!(matches!(
            parse_options(&[("vid", "xyz")]),
            Err(NusbError::InvalidParameter(_))
        ));
        assert!(parse_options(&[("bus", "300")]).is_err());
        assert!(parse_options(&[("transfer-size", "0")]).is_err());
    }
}
