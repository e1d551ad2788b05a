//! nusb implementation of [`DfuTransport`]

use std::num::NonZeroU8;
use std::time::{Duration, Instant};

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient, TransferError};
use nusb::{Device, DeviceInfo, Interface, MaybeFuture};
use rdfu_core::descriptor::{
    DFU_FUNCTIONAL_DESCRIPTOR_TYPE, USB_CLASS_APPLICATION_SPECIFIC, USB_SUBCLASS_DFU,
};
use rdfu_core::target::TargetConfig;
use rdfu_core::transport::{DfuInterface, DfuTransport, TransportError, UsbIds};

use crate::error::{NusbError, Result};

/// US English, the language every DFU bootloader seen so far provides
const LANGUAGE_ID: u16 = 0x0409;

/// Timeout for string descriptor requests
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(1);

/// How often the bus is scanned while waiting for a device to come back
const REPLUG_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Device selection and transfer options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NusbConfig {
    /// Only match this vendor ID
    pub vid: Option<u16>,
    /// Only match this product ID
    pub pid: Option<u16>,
    /// Only match this serial number
    pub serial: Option<String>,
    /// Only match devices on this bus
    pub bus: Option<u8>,
    /// Only match the device with this address
    pub address: Option<u8>,
    /// Control transfer timeout
    pub timeout: Option<Duration>,
    /// Override wTransferSize from the functional descriptor
    pub transfer_size: Option<u16>,
}

impl NusbConfig {
    /// Match a specific VID:PID pair
    pub fn with_ids(vid: u16, pid: u16) -> Self {
        Self {
            vid: Some(vid),
            pid: Some(pid),
            ..Default::default()
        }
    }

    /// Per-target settings derived from these options
    pub fn target_config(&self) -> TargetConfig {
        let mut config = TargetConfig::default();
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        config.transfer_size_override = self.transfer_size;
        config
    }

    fn matches(&self, info: &DeviceInfo) -> bool {
        if self.vid.is_some_and(|vid| vid != info.vendor_id()) {
            return false;
        }
        if self.pid.is_some_and(|pid| pid != info.product_id()) {
            return false;
        }
        if self.bus.is_some_and(|bus| bus != info.busnum()) {
            return false;
        }
        if self
            .address
            .is_some_and(|address| address != info.device_address())
        {
            return false;
        }
        if let Some(serial) = &self.serial {
            if info.serial_number() != Some(serial.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A DFU interface together with its name string
#[derive(Debug, Clone)]
pub struct DfuInterfaceInfo {
    /// Descriptor data
    pub interface: DfuInterface,
    /// iInterface string, if the device has one and it could be read
    pub name: Option<String>,
}

/// A connected device exposing at least one DFU interface
#[derive(Debug, Clone)]
pub struct NusbDeviceInfo {
    /// USB bus number
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
    /// Vendor, product and release
    pub ids: UsbIds,
    /// Serial number string
    pub serial: Option<String>,
    /// All DFU alternate settings
    pub interfaces: Vec<DfuInterfaceInfo>,
}

fn has_dfu_interface(info: &DeviceInfo) -> bool {
    info.interfaces()
        .any(|i| i.class() == USB_CLASS_APPLICATION_SPECIFIC && i.subclass() == USB_SUBCLASS_DFU)
}

fn usb_ids(info: &DeviceInfo) -> UsbIds {
    UsbIds {
        vid: info.vendor_id(),
        pid: info.product_id(),
        release: info.device_version(),
    }
}

fn find_devices(config: &NusbConfig) -> Result<Vec<DeviceInfo>> {
    let devices = nusb::list_devices()
        .wait()
        .map_err(|e| NusbError::EnumerationFailed(e.to_string()))?
        .filter(|d| config.matches(d) && has_dfu_interface(d))
        .collect();
    Ok(devices)
}

/// Collect the DFU alternate settings of the active configuration
///
/// Some bootloaders place the functional descriptor after the last
/// interface instead of inside it, so a configuration-wide one is used for
/// alternate settings that carry none.
fn dfu_interfaces(device: &Device) -> Result<Vec<DfuInterface>> {
    let config = device
        .active_configuration()
        .map_err(|e| NusbError::ConfigFailed(e.to_string()))?;

    let fallback = config
        .descriptors()
        .find(|d| d.descriptor_type() == DFU_FUNCTIONAL_DESCRIPTOR_TYPE)
        .map(|d| d.to_vec());

    let mut interfaces = Vec::new();
    for alt in config.interface_alt_settings() {
        if alt.class() != USB_CLASS_APPLICATION_SPECIFIC || alt.subclass() != USB_SUBCLASS_DFU {
            continue;
        }
        let functional_descriptor = alt
            .descriptors()
            .find(|d| d.descriptor_type() == DFU_FUNCTIONAL_DESCRIPTOR_TYPE)
            .map(|d| d.to_vec())
            .or_else(|| fallback.clone())
            .unwrap_or_default();

        log::trace!(
            "interface {} alt {} protocol {} functional descriptor {:02x?}",
            alt.interface_number(),
            alt.alternate_setting(),
            alt.protocol(),
            functional_descriptor
        );
        interfaces.push(DfuInterface {
            number: alt.interface_number(),
            alt_setting: alt.alternate_setting(),
            protocol: alt.protocol(),
            name_index: alt.string_index().map_or(0, NonZeroU8::get),
            functional_descriptor,
        });
    }
    Ok(interfaces)
}

fn read_string(device: &Device, index: u8) -> std::result::Result<String, TransportError> {
    let index = NonZeroU8::new(index).ok_or(TransportError::NotSupported)?;
    device
        .get_string_descriptor(index, LANGUAGE_ID, DESCRIPTOR_TIMEOUT)
        .wait()
        .map_err(|e| TransportError::Other(e.to_string()))
}

fn map_transfer_error(e: TransferError) -> TransportError {
    match e {
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        TransferError::Cancelled => TransportError::Timeout,
        other => TransportError::Other(other.to_string()),
    }
}

/// List every connected device with a DFU interface
pub fn list_dfu_devices(config: &NusbConfig) -> Result<Vec<NusbDeviceInfo>> {
    let mut result = Vec::new();
    for info in find_devices(config)? {
        let device = match info.open().wait() {
            Ok(d) => d,
            Err(e) => {
                log::debug!(
                    "Skipping {:04x}:{:04x}: {}",
                    info.vendor_id(),
                    info.product_id(),
                    e
                );
                continue;
            }
        };
        let interfaces = dfu_interfaces(&device)?
            .into_iter()
            .map(|interface| {
                let name = read_string(&device, interface.name_index).ok();
                DfuInterfaceInfo { interface, name }
            })
            .collect();

        result.push(NusbDeviceInfo {
            bus: info.busnum(),
            address: info.device_address(),
            ids: usb_ids(&info),
            serial: info.serial_number().map(String::from),
            interfaces,
        });
    }
    Ok(result)
}

/// Blocking DFU transport over an opened nusb device
pub struct NusbTransport {
    device: Device,
    ids: UsbIds,
    bus: u8,
    address: u8,
    serial: Option<String>,
    interfaces: Vec<DfuInterface>,
    /// Claimed interfaces by interface number
    claimed: Vec<(u8, Interface)>,
}

impl NusbTransport {
    /// Open the single device matching `config`
    pub fn open(config: &NusbConfig) -> Result<Self> {
        let devices = find_devices(config)?;
        match devices.len() {
            0 => Err(NusbError::DeviceNotFound),
            1 => Self::open_info(&devices[0]),
            n => Err(NusbError::MultipleDevicesFound(n)),
        }
    }

    /// Open a device found by [`list_dfu_devices`] or `nusb::list_devices`
    pub fn open_info(info: &DeviceInfo) -> Result<Self> {
        log::info!(
            "Opening {:04x}:{:04x} at bus {} address {}",
            info.vendor_id(),
            info.product_id(),
            info.busnum(),
            info.device_address()
        );
        let device = info
            .open()
            .wait()
            .map_err(|e| NusbError::OpenFailed(e.to_string()))?;
        let interfaces = dfu_interfaces(&device)?;
        log::debug!("Found {} DFU alternate settings", interfaces.len());

        Ok(Self {
            device,
            ids: usb_ids(info),
            bus: info.busnum(),
            address: info.device_address(),
            serial: info.serial_number().map(String::from),
            interfaces,
            claimed: Vec::new(),
        })
    }

    /// USB bus number
    pub fn bus(&self) -> u8 {
        self.bus
    }

    /// Device address on the bus
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Serial number string
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn interface(&self, index: u16) -> std::result::Result<&Interface, TransportError> {
        let number = (index & 0xff) as u8;
        self.claimed
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, iface)| iface)
            .ok_or_else(|| TransportError::Other(format!("interface {} is not claimed", number)))
    }

    fn is_replugged(&self, info: &DeviceInfo) -> bool {
        if info.busnum() != self.bus || info.device_address() == self.address {
            return false;
        }
        if info.vendor_id() != self.ids.vid {
            return false;
        }
        match &self.serial {
            Some(serial) => info.serial_number() == Some(serial.as_str()),
            None => true,
        }
    }

    fn reopen(&mut self, info: &DeviceInfo) -> std::result::Result<(), TransportError> {
        let device = info
            .open()
            .wait()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        // A runtime firmware may not expose DFU at all
        self.interfaces = dfu_interfaces(&device).unwrap_or_default();
        self.device = device;
        self.ids = usb_ids(info);
        self.address = info.device_address();
        self.serial = info.serial_number().map(String::from);
        Ok(())
    }
}

impl DfuTransport for NusbTransport {
    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        self.interface(index)?
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    length,
                },
                timeout,
            )
            .wait()
            .map_err(map_transfer_error)
    }

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        self.interface(index)?
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(map_transfer_error)?;
        Ok(data.len())
    }

    fn usb_ids(&self) -> UsbIds {
        self.ids
    }

    fn interfaces(&self) -> Vec<DfuInterface> {
        self.interfaces.clone()
    }

    fn claim_interface(&mut self, interface: u8) -> std::result::Result<(), TransportError> {
        if self.claimed.iter().any(|(n, _)| *n == interface) {
            return Ok(());
        }
        let claimed = self
            .device
            .claim_interface(interface)
            .wait()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        log::debug!("Claimed interface {}", interface);
        self.claimed.push((interface, claimed));
        Ok(())
    }

    fn set_alt_setting(
        &mut self,
        interface: u8,
        alt_setting: u8,
    ) -> std::result::Result<(), TransportError> {
        self.interface(u16::from(interface))?
            .set_alt_setting(alt_setting)
            .wait()
            .map_err(|e| TransportError::Other(e.to_string()))
    }

    fn string_descriptor(&mut self, index: u8) -> std::result::Result<String, TransportError> {
        read_string(&self.device, index)
    }

    fn reset(&mut self) -> std::result::Result<(), TransportError> {
        log::debug!("Resetting USB device");
        self.claimed.clear();
        self.device
            .reset()
            .wait()
            .map_err(|e| TransportError::Other(e.to_string()))
    }

    fn wait_for_replug(&mut self, timeout: Duration) -> std::result::Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        self.claimed.clear();
        loop {
            std::thread::sleep(REPLUG_POLL_INTERVAL);
            let devices = nusb::list_devices()
                .wait()
                .map_err(|e| TransportError::Other(e.to_string()))?;
            let found: Vec<DeviceInfo> = devices.filter(|d| self.is_replugged(d)).collect();
            for info in &found {
                self.ids.check_replugged(&usb_ids(info))?;
                match self.reopen(info) {
                    Ok(()) => {
                        log::info!(
                            "Device re-enumerated as {:04x}:{:04x} at address {}",
                            self.ids.vid,
                            self.ids.pid,
                            self.address
                        );
                        return Ok(());
                    }
                    Err(e) => log::debug!("Device not ready yet: {}", e),
                }
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
        }
    }
}
