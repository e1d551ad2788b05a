//! USB transport abstraction
//!
//! The engine never touches a USB stack directly. Everything it needs from
//! the bus is expressed by [`DfuTransport`]: class control transfers to the
//! DFU interface, a few descriptor lookups, interface selection and a host
//! side reset. `rdfu-nusb` implements it over real hardware and
//! `rdfu-dummy` over an in-memory emulator.

use std::time::Duration;

use thiserror::Error;

/// Low-level USB failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The device did not answer in time
    #[error("USB transfer timed out")]
    Timeout,

    /// The device stalled the control pipe
    #[error("USB pipe stall")]
    Stall,

    /// The device went away
    #[error("device disconnected")]
    Disconnected,

    /// The operation is not available on this transport
    #[error("operation not supported by transport")]
    NotSupported,

    /// Anything else reported by the USB stack
    #[error("USB error: {0}")]
    Other(String),
}

/// Identity of the USB device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsbIds {
    /// idVendor
    pub vid: u16,
    /// idProduct
    pub pid: u16,
    /// bcdDevice
    pub release: u16,
}

impl UsbIds {
    /// Check the identity a device re-enumerated with
    ///
    /// Switching between runtime and DFU mode changes VID:PID, so coming
    /// back with the same pair means the switch did not happen.
    pub fn check_replugged(&self, new: &UsbIds) -> Result<(), TransportError> {
        if self.vid == new.vid && self.pid == new.pid {
            return Err(TransportError::Other(format!(
                "device came back with identical VID:PID {:04x}:{:04x}",
                new.vid, new.pid
            )));
        }
        Ok(())
    }
}

/// One DFU interface alternate setting as found in the configuration
/// descriptor
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DfuInterface {
    /// bInterfaceNumber
    pub number: u8,
    /// bAlternateSetting
    pub alt_setting: u8,
    /// bInterfaceProtocol, 1 for runtime and 2 for DFU mode
    pub protocol: u8,
    /// iInterface string index, 0 if absent
    pub name_index: u8,
    /// Raw DFU functional descriptor, empty if the device has none
    pub functional_descriptor: Vec<u8>,
}

/// Blocking access to a DFU-capable USB device
///
/// All control transfers are class requests addressed to an interface;
/// `index` carries the interface number.
pub trait DfuTransport {
    /// Class IN control transfer returning at most `length` bytes
    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Class OUT control transfer, returning the number of bytes sent
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Vendor, product and release of the device
    fn usb_ids(&self) -> UsbIds;

    /// All DFU interfaces of the active configuration
    fn interfaces(&self) -> Vec<DfuInterface>;

    /// Claim an interface for exclusive use
    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    /// Select an alternate setting on a claimed interface
    fn set_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError>;

    /// Read a string descriptor in the default language
    fn string_descriptor(&mut self, index: u8) -> Result<String, TransportError>;

    /// Host-side USB port reset
    fn reset(&mut self) -> Result<(), TransportError>;

    /// Wait until the device re-enumerates after a reset or detach
    ///
    /// Implementations that cannot track re-enumeration return
    /// [`TransportError::NotSupported`].
    fn wait_for_replug(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        Err(TransportError::NotSupported)
    }

    /// Sleep between requests, e.g. for the device's poll timeout
    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<T: DfuTransport + ?Sized> DfuTransport for &mut T {
    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).control_in(request, value, index, length, timeout)
    }

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        (**self).control_out(request, value, index, data, timeout)
    }

    fn usb_ids(&self) -> UsbIds {
        (**self).usb_ids()
    }

    fn interfaces(&self) -> Vec<DfuInterface> {
        (**self).interfaces()
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        (**self).claim_interface(interface)
    }

    fn set_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        (**self).set_alt_setting(interface, alt_setting)
    }

    fn string_descriptor(&mut self, index: u8) -> Result<String, TransportError> {
        (**self).string_descriptor(index)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        (**self).reset()
    }

    fn wait_for_replug(&mut self, timeout: Duration) -> Result<(), TransportError> {
        (**self).wait_for_replug(timeout)
    }

    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_replugged() {
        let dfu = UsbIds {
            vid: 0x0483,
            pid: 0xdf11,
            release: 0x2200,
        };
        let runtime = UsbIds {
            pid: 0x5740,
            release: 0x0100,
            ..dfu
        };
        assert!(dfu.check_replugged(&runtime).is_ok());
        assert!(runtime.check_replugged(&dfu).is_ok());

        // a new bcdDevice alone is not a mode switch
        let same = UsbIds {
            release: 0x0300,
            ..dfu
        };
        assert!(matches!(
            dfu.check_replugged(&same),
            Err(TransportError::Other(_))
        ));
    }
}
