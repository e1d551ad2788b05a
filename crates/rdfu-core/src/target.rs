//! One DFU alternate setting and its request primitives
//!
//! A [`DfuTarget`] caches everything the engine needs to know about an
//! alternate setting (functional descriptor, DfuSe sector map, last status)
//! and wraps each DFU request. It does not own the USB handle: every
//! operation takes the transport as an argument, so a target can never
//! outlive or race the device it belongs to.

use std::time::Duration;

use bitflags::bitflags;

use crate::descriptor::{Attributes, FunctionalDescriptor, Mode, Quirks, QUIRK_POLL_TIMEOUT_MS};
use crate::error::{Error, Result};
use crate::firmware::CipherKind;
use crate::protocol::{
    dfuse_command, DfuState, DfuStatus, Request, StatusResponse, DFUSE_BLOCK_OFFSET,
    DFUSE_CMD_ERASE, DFUSE_CMD_READ_UNPROTECT, DFUSE_CMD_SET_ADDRESS_POINTER, GETSTATUS_LEN,
};
use crate::sector::SectorMap;
use crate::transport::{DfuInterface, DfuTransport, TransportError, UsbIds};

/// Default timeout for a single control transfer
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Longest time to wait for a device to leave dfuDNBUSY
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-target configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetConfig {
    /// Timeout for each control transfer
    pub timeout: Duration,
    /// Use this wTransferSize instead of the one in the functional descriptor
    pub transfer_size_override: Option<u16>,
    /// Give up if the device stays busy this long
    pub busy_timeout: Duration,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            transfer_size_override: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

bitflags! {
    /// Flags for [`DfuTarget::open`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u8 {
        /// Do not query the status or recover a stale state on open
        const NO_AUTO_REFRESH = 1 << 0;
    }
}

/// A DFU alternate setting
#[derive(Debug, Clone)]
pub struct DfuTarget {
    interface: DfuInterface,
    ids: UsbIds,
    config: TargetConfig,
    descriptor: FunctionalDescriptor,
    quirks: Quirks,
    mode: Mode,
    name: Option<String>,
    sectors: SectorMap,
    cipher_kind: CipherKind,
    state: DfuState,
    status: DfuStatus,
    poll_timeout_ms: u32,
    opened: bool,
}

impl DfuTarget {
    /// Describe a target without touching the device
    pub fn new(interface: DfuInterface, ids: UsbIds, config: TargetConfig) -> Self {
        let quirks = Quirks::for_device(ids.vid, ids.pid, ids.release);
        let descriptor = FunctionalDescriptor::parse(&interface.functional_descriptor, quirks)
            .unwrap_or_else(|| {
                log::debug!(
                    "interface {} alt {} has no functional descriptor, assuming defaults",
                    interface.number,
                    interface.alt_setting
                );
                FunctionalDescriptor::default()
            });
        let mode = if quirks.contains(Quirks::FORCE_DFU_MODE) {
            Mode::Dfu
        } else {
            Mode::from_protocol(interface.protocol)
        };

        Self {
            interface,
            ids,
            config,
            descriptor,
            quirks,
            mode,
            name: None,
            sectors: SectorMap::default(),
            cipher_kind: CipherKind::None,
            state: DfuState::AppIdle,
            status: DfuStatus::Ok,
            poll_timeout_ms: 0,
            opened: false,
        }
    }

    /// Claim the interface, select the alternate setting and read its name
    ///
    /// Unless [`OpenFlags::NO_AUTO_REFRESH`] is given, a device in DFU mode
    /// is queried and a stale upload or download is aborted, or a
    /// dfuERROR state cleared.
    ///
    /// Opening an already open target only selects its alternate setting
    /// again, which is needed after another target of the same interface
    /// was used.
    pub fn open<T: DfuTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        flags: OpenFlags,
    ) -> Result<()> {
        if self.opened {
            return self.select(transport);
        }

        transport.claim_interface(self.interface.number).map_err(|e| {
            Error::transport(
                format!("cannot claim interface {}", self.interface.number),
                e,
            )
        })?;
        self.select(transport)?;

        if self.interface.name_index != 0 {
            match transport.string_descriptor(self.interface.name_index) {
                Ok(name) => self.set_name(&name)?,
                Err(e) => log::warn!(
                    "cannot read name of alt setting {}: {}",
                    self.interface.alt_setting,
                    e
                ),
            }
        }
        self.opened = true;

        if flags.contains(OpenFlags::NO_AUTO_REFRESH) || self.mode != Mode::Dfu {
            return Ok(());
        }

        self.refresh(transport)?;
        match self.state {
            DfuState::DfuUploadIdle | DfuState::DfuDnloadIdle | DfuState::DfuDnloadSync => {
                log::debug!("aborting stale {} state", self.state);
                self.abort(transport)?;
            }
            DfuState::DfuError => {
                log::debug!("clearing {} status", self.status);
                self.clear_status(transport)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn select<T: DfuTransport + ?Sized>(&mut self, transport: &mut T) -> Result<()> {
        transport
            .set_alt_setting(self.interface.number, self.interface.alt_setting)
            .map_err(|e| {
                Error::transport(
                    format!("cannot select alt setting {}", self.interface.alt_setting),
                    e,
                )
            })
    }

    /// Set the alternate-setting name and decode its sector map
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let sectors = SectorMap::parse(name)?;
        self.cipher_kind = sectors.cipher_kind();
        self.sectors = sectors;
        self.name = Some(name.to_string());
        Ok(())
    }

    /// Whether [`open`](Self::open) has completed
    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// bInterfaceNumber
    pub fn interface_number(&self) -> u8 {
        self.interface.number
    }

    /// bAlternateSetting
    pub fn alt_setting(&self) -> u8 {
        self.interface.alt_setting
    }

    /// Full alternate-setting name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Title of the DfuSe memory map, or the whole name otherwise
    pub fn display_name(&self) -> Option<&str> {
        self.sectors.title().or(self.name.as_deref())
    }

    /// Decoded DfuSe memory map
    pub fn sectors(&self) -> &SectorMap {
        &self.sectors
    }

    /// Cipher signalled by the alternate-setting name
    pub fn cipher_kind(&self) -> CipherKind {
        self.cipher_kind
    }

    /// Functional descriptor
    pub fn descriptor(&self) -> &FunctionalDescriptor {
        &self.descriptor
    }

    /// bmAttributes
    pub fn attributes(&self) -> Attributes {
        self.descriptor.attributes
    }

    /// Check a functional attribute
    pub fn can(&self, attribute: Attributes) -> bool {
        self.descriptor.attributes.contains(attribute)
    }

    /// Effective wTransferSize
    pub fn transfer_size(&self) -> u16 {
        self.config
            .transfer_size_override
            .filter(|&size| size != 0)
            .unwrap_or(self.descriptor.transfer_size)
    }

    /// Whether this target speaks the ST DfuSe extension
    pub fn is_dfuse(&self) -> bool {
        self.descriptor.is_dfuse()
    }

    /// Runtime or DFU mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Active device quirks
    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    /// USB identity of the device
    pub fn usb_ids(&self) -> UsbIds {
        self.ids
    }

    /// Configuration
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// State from the last GETSTATUS
    pub fn state(&self) -> DfuState {
        self.state
    }

    /// Status from the last GETSTATUS
    pub fn status(&self) -> DfuStatus {
        self.status
    }

    /// Poll timeout from the last GETSTATUS
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms as u64)
    }

    fn index(&self) -> u16 {
        self.interface.number as u16
    }

    /// Issue GETSTATUS and cache the result
    pub fn refresh<T: DfuTransport + ?Sized>(&mut self, transport: &mut T) -> Result<StatusResponse> {
        let buf = transport
            .control_in(
                Request::GetStatus.code(),
                0,
                self.index(),
                GETSTATUS_LEN as u16,
                self.config.timeout,
            )
            .map_err(|e| Error::transport("cannot get status", e))?;
        let mut response = StatusResponse::parse(&buf).ok_or_else(|| {
            Error::InvalidDevice(format!(
                "GETSTATUS returned {} bytes, expected {}",
                buf.len(),
                GETSTATUS_LEN
            ))
        })?;
        if self.quirks.contains(Quirks::IGNORE_POLLTIMEOUT) {
            response.poll_timeout_ms = QUIRK_POLL_TIMEOUT_MS;
        }

        if response.state != self.state {
            log::debug!("state {} -> {}", self.state, response.state);
        }
        self.state = response.state;
        self.status = response.status;
        self.poll_timeout_ms = response.poll_timeout_ms;
        Ok(response)
    }

    /// Wait for the device to finish the last request and check for errors
    ///
    /// While the device reports a busy state the host sleeps for the poll
    /// timeout and asks again. A device left in dfuERROR is reported as
    /// [`Error::DeviceStatus`].
    pub fn check_status<T: DfuTransport + ?Sized>(&mut self, transport: &mut T) -> Result<()> {
        self.refresh(transport)?;

        let mut waited = Duration::ZERO;
        while self.state.is_busy() {
            let poll = self.poll_timeout().max(Duration::from_millis(1));
            if waited >= self.config.busy_timeout {
                return Err(Error::InvalidDevice(format!(
                    "device still in {} after {} ms",
                    self.state,
                    waited.as_millis()
                )));
            }
            log::trace!("waiting {} ms for {} to clear", poll.as_millis(), self.state);
            transport.delay(poll);
            waited += poll;
            self.refresh(transport)?;
        }

        if self.state != DfuState::DfuError {
            return Ok(());
        }

        let message = match self.status {
            DfuStatus::ErrVendor if self.is_dfuse() => "Read protection is active",
            DfuStatus::ErrTarget if self.is_dfuse() => "Address is wrong or unsupported",
            status => status.description(),
        };
        log::warn!("device reported {}: {}", self.status, message);
        Err(Error::DeviceStatus {
            status: self.status,
            message,
        })
    }

    /// Send ABORT, returning the device to dfuIDLE
    pub fn abort<T: DfuTransport + ?Sized>(&mut self, transport: &mut T) -> Result<()> {
        transport
            .control_out(Request::Abort.code(), 0, self.index(), &[], self.config.timeout)
            .map_err(|e| Error::transport("cannot abort", e))?;
        Ok(())
    }

    /// Send CLRSTATUS, leaving dfuERROR
    pub fn clear_status<T: DfuTransport + ?Sized>(&mut self, transport: &mut T) -> Result<()> {
        transport
            .control_out(Request::ClrStatus.code(), 0, self.index(), &[], self.config.timeout)
            .map_err(|e| Error::transport("cannot clear status", e))?;
        self.state = DfuState::DfuIdle;
        self.status = DfuStatus::Ok;
        Ok(())
    }

    /// Switch a runtime-mode device into DFU mode
    ///
    /// The host resets the device afterwards unless it detaches by itself.
    pub fn detach<T: DfuTransport + ?Sized>(&mut self, transport: &mut T) -> Result<()> {
        if self.mode == Mode::Dfu {
            log::debug!("already in DFU mode");
            return Ok(());
        }

        log::info!("detaching");
        match transport.control_out(
            Request::Detach.code(),
            self.descriptor.detach_timeout,
            self.index(),
            &[],
            self.config.timeout,
        ) {
            Ok(_) => {}
            // Some devices reboot before completing the request
            Err(e @ (TransportError::Stall | TransportError::Disconnected)) => {
                log::debug!("ignoring detach failure: {}", e);
            }
            Err(e) => return Err(Error::transport("cannot detach", e)),
        }

        if !self.can(Attributes::WILL_DETACH) {
            log::debug!("device does not detach by itself, resetting");
            transport
                .reset()
                .map_err(|e| Error::transport("cannot reset after detach", e))?;
        }
        self.state = DfuState::AppDetach;
        Ok(())
    }

    /// Leave DFU mode and start the application
    pub fn attach<T: DfuTransport + ?Sized>(&mut self, transport: &mut T) -> Result<()> {
        log::info!("attaching");
        if self.is_dfuse() {
            // a zero-length download at the first data block leaves DFU mode
            match transport.control_out(
                Request::Dnload.code(),
                DFUSE_BLOCK_OFFSET,
                self.index(),
                &[],
                self.config.timeout,
            ) {
                Ok(_) => {}
                Err(TransportError::NotSupported) => {}
                Err(e) => return Err(Error::transport("cannot leave DFU mode", e)),
            }
            // the device manifests on GETSTATUS and may vanish while answering
            if let Err(e) = self.refresh(transport) {
                log::debug!("ignoring status after leave request: {}", e);
            }
            return Ok(());
        }

        transport
            .reset()
            .map_err(|e| Error::transport("cannot reset device", e))?;
        Ok(())
    }

    /// Send a DNLOAD request without waiting for the result
    pub fn download_chunk<T: DfuTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        block: u16,
        data: &[u8],
    ) -> Result<()> {
        log::trace!("DNLOAD block {} ({} bytes)", block, data.len());
        let sent = transport
            .control_out(Request::Dnload.code(), block, self.index(), data, self.config.timeout)
            .map_err(|e| Error::transport(format!("cannot download block {}", block), e))?;
        if sent != data.len() {
            return Err(Error::InvalidDevice(format!(
                "only sent 0x{:04x} of 0x{:04x} bytes of block {}",
                sent,
                data.len(),
                block
            )));
        }
        Ok(())
    }

    /// Send an UPLOAD request and return what the device answered
    pub fn upload_chunk<T: DfuTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        block: u16,
        length: u16,
    ) -> Result<Vec<u8>> {
        let data = transport
            .control_in(Request::Upload.code(), block, self.index(), length, self.config.timeout)
            .map_err(|e| Error::transport(format!("cannot upload block {}", block), e))?;
        log::trace!("UPLOAD block {} ({} bytes)", block, data.len());
        Ok(data)
    }

    fn dfuse_request<T: DfuTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        payload: &[u8],
        what: &str,
    ) -> Result<()> {
        if !self.is_dfuse() {
            return Err(Error::NotSupported(format!("{} needs a DfuSe device", what)));
        }
        transport
            .control_out(Request::Dnload.code(), 0, self.index(), payload, self.config.timeout)
            .map_err(|e| Error::transport(format!("cannot {}", what), e))?;
        Ok(())
    }

    /// Point the DfuSe address pointer at `address`
    pub fn set_address<T: DfuTransport + ?Sized>(&mut self, transport: &mut T, address: u32) -> Result<()> {
        log::debug!("setting address pointer to 0x{:08x}", address);
        let cmd = dfuse_command(DFUSE_CMD_SET_ADDRESS_POINTER, address);
        self.dfuse_request(transport, &cmd, &format!("set address 0x{:08x}", address))?;
        self.check_status(transport)
    }

    /// Erase the DfuSe page containing `address`
    pub fn erase_page<T: DfuTransport + ?Sized>(&mut self, transport: &mut T, address: u32) -> Result<()> {
        log::debug!("erasing page at 0x{:08x}", address);
        let cmd = dfuse_command(DFUSE_CMD_ERASE, address);
        self.dfuse_request(transport, &cmd, &format!("erase 0x{:08x}", address))?;
        // the first status request starts the erase, the second collects it
        self.check_status(transport)?;
        self.check_status(transport)
    }

    /// Remove DfuSe read protection, which mass-erases the device
    pub fn read_unprotect<T: DfuTransport + ?Sized>(&mut self, transport: &mut T) -> Result<()> {
        log::info!("removing read protection");
        self.dfuse_request(transport, &[DFUSE_CMD_READ_UNPROTECT], "read unprotect")?;
        self.check_status(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::DFU_VERSION_DFUSE;

    fn interface(version: u16) -> DfuInterface {
        let v = version.to_le_bytes();
        DfuInterface {
            number: 0,
            alt_setting: 1,
            protocol: 2,
            name_index: 4,
            functional_descriptor: vec![0x09, 0x21, 0x0b, 0xff, 0x00, 0x00, 0x04, v[0], v[1]],
        }
    }

    #[test]
    fn test_new_from_descriptor() {
        let target = DfuTarget::new(
            interface(DFU_VERSION_DFUSE),
            UsbIds::default(),
            TargetConfig::default(),
        );
        assert!(target.is_dfuse());
        assert_eq!(target.transfer_size(), 1024);
        assert_eq!(target.mode(), Mode::Dfu);
        assert_eq!(target.alt_setting(), 1);
        assert!(target.can(Attributes::WILL_DETACH));
        assert!(!target.is_open());
    }

    #[test]
    fn test_transfer_size_override() {
        let config = TargetConfig {
            transfer_size_override: Some(256),
            ..Default::default()
        };
        let target = DfuTarget::new(interface(0x0100), UsbIds::default(), config);
        assert_eq!(target.transfer_size(), 256);
        assert!(!target.is_dfuse());
    }

    #[test]
    fn test_missing_descriptor_uses_defaults() {
        let mut iface = interface(0x0100);
        iface.functional_descriptor.clear();
        let target = DfuTarget::new(iface, UsbIds::default(), TargetConfig::default());
        assert_eq!(target.transfer_size(), 64);
        assert!(target.can(Attributes::CAN_DOWNLOAD));
    }

    #[test]
    fn test_set_name() {
        let mut target = DfuTarget::new(
            interface(DFU_VERSION_DFUSE),
            UsbIds::default(),
            TargetConfig::default(),
        );
        target
            .set_name("@Internal Flash  /0x08000000/04*016Kg|XTEA")
            .unwrap();
        assert_eq!(target.display_name(), Some("Internal Flash"));
        assert_eq!(target.sectors().sectors().len(), 4);
        assert_eq!(target.cipher_kind(), CipherKind::Xtea);

        assert!(target.set_name("@Flash/0x0/4*1Kz").is_err());
    }

    #[test]
    fn test_forced_dfu_mode() {
        let mut iface = interface(0x0100);
        iface.protocol = 1;
        let ids = UsbIds {
            vid: 0x1fc9,
            pid: 0x000c,
            release: 0,
        };
        let target = DfuTarget::new(iface, ids, TargetConfig::default());
        assert_eq!(target.mode(), Mode::Dfu);
    }
}
