//! rdfu-dummy - In-memory DFU device emulator for testing
//!
//! This crate provides a [`DfuTransport`] that emulates a DFU 1.0 or ST
//! DfuSe bootloader in memory. Every request is logged so tests can check
//! exactly what the engine sent, and failures can be injected to exercise
//! the error paths without real hardware.

use std::time::Duration;

use rdfu_core::descriptor::{Attributes, DFU_FUNCTIONAL_DESCRIPTOR_TYPE};
use rdfu_core::firmware::{DFU_VERSION_DFUSE, DFU_VERSION_DFU_1_0};
use rdfu_core::protocol::{
    DfuState, DfuStatus, Request, StatusResponse, DFUSE_BLOCK_OFFSET, DFUSE_CMD_ERASE,
    DFUSE_CMD_READ_UNPROTECT, DFUSE_CMD_SET_ADDRESS_POINTER,
};
use rdfu_core::sector::SectorMap;
use rdfu_core::transport::{DfuInterface, DfuTransport, TransportError, UsbIds};

/// Size of emulated memory behind a zero-sized (RAM) sector
const OPEN_ENDED_SIZE: usize = 64 * 1024;

/// Configuration for the emulated device
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// idVendor
    pub vid: u16,
    /// idProduct
    pub pid: u16,
    /// bcdDevice
    pub release: u16,
    /// Speak the DfuSe extension
    pub dfuse: bool,
    /// Start in runtime mode
    pub runtime: bool,
    /// idProduct reported in runtime mode, `None` to keep `pid`
    pub runtime_pid: Option<u16>,
    /// wTransferSize
    pub transfer_size: u16,
    /// bmAttributes
    pub attributes: Attributes,
    /// wDetachTimeOut
    pub detach_timeout: u16,
    /// bwPollTimeout reported by GETSTATUS
    pub poll_timeout_ms: u32,
    /// Number of dfuDNBUSY replies after each download request
    pub busy_polls: u32,
    /// One name per alternate setting
    pub alt_names: Vec<String>,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            vid: 0x1234,
            pid: 0x5678,
            release: 0x0100,
            dfuse: false,
            runtime: false,
            runtime_pid: Some(0x5679),
            transfer_size: 64,
            attributes: Attributes::CAN_DOWNLOAD
                | Attributes::CAN_UPLOAD
                | Attributes::MANIFEST_TOL,
            detach_timeout: 1000,
            poll_timeout_ms: 0,
            busy_polls: 0,
            alt_names: vec!["Dummy".to_string()],
        }
    }
}

impl DummyConfig {
    /// A small STM32-like DfuSe bootloader with 16 x 1 KiB flash pages
    pub fn dfuse() -> Self {
        Self {
            vid: 0x0483,
            pid: 0xdf11,
            release: 0x2200,
            dfuse: true,
            runtime_pid: Some(0x5740),
            transfer_size: 256,
            attributes: Attributes::CAN_DOWNLOAD
                | Attributes::CAN_UPLOAD
                | Attributes::MANIFEST_TOL
                | Attributes::WILL_DETACH,
            alt_names: vec!["@Internal Flash  /0x08000000/16*001Kg".to_string()],
            ..Self::default()
        }
    }
}

/// One logged control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// Payload for OUT requests, empty for IN
    pub data: Vec<u8>,
}

/// Memory behind one alternate setting
#[derive(Debug, Clone)]
struct Memory {
    base: u32,
    data: Vec<u8>,
    sectors: SectorMap,
}

impl Memory {
    fn new(name: &str, dfuse: bool) -> Self {
        let sectors = if dfuse {
            SectorMap::parse(name).unwrap_or_default()
        } else {
            SectorMap::default()
        };
        let base = sectors.sectors().iter().map(|s| s.address).min().unwrap_or(0);
        let end = sectors
            .sectors()
            .iter()
            .map(|s| {
                let size = if s.size == 0 { OPEN_ENDED_SIZE as u64 } else { s.size as u64 };
                s.address as u64 + size
            })
            .max()
            .unwrap_or(base as u64);
        let size = (end - base as u64) as usize;
        Self {
            base,
            data: vec![0xFF; size],
            sectors,
        }
    }

    fn range(&self, address: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = address.checked_sub(self.base)? as usize;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }
}

/// Emulated DFU device
pub struct DummyDfu {
    config: DummyConfig,
    memories: Vec<Memory>,
    alt_setting: u8,
    claimed: Option<u8>,
    runtime: bool,
    state: DfuState,
    status: DfuStatus,
    busy_left: u32,
    address_pointer: u32,
    read_protected: bool,
    stuck_byte: Option<(u32, u8)>,
    fail_next_download: Option<DfuStatus>,
    disconnected: bool,
    manifested: bool,
    resets: usize,
    reenumerating: bool,
    enumerated_as: UsbIds,
    delayed: Duration,
    requests: Vec<LoggedRequest>,
    erased: Vec<u32>,
}

impl DummyDfu {
    /// Create a new emulated device
    pub fn new(config: DummyConfig) -> Self {
        let memories = config
            .alt_names
            .iter()
            .map(|name| Memory::new(name, config.dfuse))
            .collect();
        let runtime = config.runtime;
        let mut dev = Self {
            config,
            memories,
            alt_setting: 0,
            claimed: None,
            runtime,
            state: if runtime { DfuState::AppIdle } else { DfuState::DfuIdle },
            status: DfuStatus::Ok,
            busy_left: 0,
            address_pointer: 0,
            read_protected: false,
            stuck_byte: None,
            fail_next_download: None,
            disconnected: false,
            manifested: false,
            resets: 0,
            reenumerating: false,
            enumerated_as: UsbIds::default(),
            delayed: Duration::ZERO,
            requests: Vec::new(),
            erased: Vec::new(),
        };
        dev.enumerated_as = dev.usb_ids();
        dev
    }

    /// Create a plain DFU 1.0 device with default configuration
    pub fn new_default() -> Self {
        Self::new(DummyConfig::default())
    }

    /// Create a device whose first alternate setting holds `data`
    pub fn with_data(config: DummyConfig, data: &[u8]) -> Self {
        let mut dev = Self::new(config);
        if let Some(mem) = dev.memories.first_mut() {
            if dev.config.dfuse {
                let len = data.len().min(mem.data.len());
                mem.data[..len].copy_from_slice(&data[..len]);
            } else {
                mem.data = data.to_vec();
            }
        }
        dev
    }

    /// Get the configuration
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Memory of an alternate setting
    pub fn memory(&self, alt_setting: u8) -> &[u8] {
        self.memories
            .get(alt_setting as usize)
            .map(|m| m.data.as_slice())
            .unwrap_or(&[])
    }

    /// Read back `len` bytes at an absolute DfuSe address of alt setting 0
    pub fn read(&self, address: u32, len: usize) -> Option<&[u8]> {
        let mem = self.memories.first()?;
        mem.range(address, len).map(|r| &mem.data[r])
    }

    /// Every request received so far
    pub fn requests(&self) -> &[LoggedRequest] {
        &self.requests
    }

    /// Number of requests with the given code
    pub fn count(&self, request: Request) -> usize {
        self.requests
            .iter()
            .filter(|r| r.request == request.code())
            .count()
    }

    /// DNLOAD requests carrying firmware data or the terminator
    ///
    /// DfuSe vendor commands on block 0 are not included.
    pub fn data_downloads(&self) -> Vec<&LoggedRequest> {
        let first = if self.config.dfuse { DFUSE_BLOCK_OFFSET } else { 0 };
        self.requests
            .iter()
            .filter(|r| r.request == Request::Dnload.code() && r.value >= first)
            .collect()
    }

    /// Addresses passed to the DfuSe erase command, in order
    pub fn erased_pages(&self) -> &[u32] {
        &self.erased
    }

    /// Addresses passed to the DfuSe set-address command, in order
    pub fn address_pointers(&self) -> Vec<u32> {
        self.requests
            .iter()
            .filter(|r| {
                r.request == Request::Dnload.code()
                    && r.value == 0
                    && r.data.first() == Some(&DFUSE_CMD_SET_ADDRESS_POINTER)
            })
            .filter_map(|r| le_address(&r.data))
            .collect()
    }

    /// Forget the request and erase logs
    pub fn clear_log(&mut self) {
        self.requests.clear();
        self.erased.clear();
    }

    /// Total time the host asked to sleep
    pub fn delayed(&self) -> Duration {
        self.delayed
    }

    /// Number of host-side resets
    pub fn resets(&self) -> usize {
        self.resets
    }

    /// Whether the device left DFU mode after a zero-length download
    pub fn manifested(&self) -> bool {
        self.manifested
    }

    /// Whether the device is in runtime mode
    pub fn is_runtime(&self) -> bool {
        self.runtime
    }

    /// Current device state
    pub fn state(&self) -> DfuState {
        self.state
    }

    /// Force the device into a state, e.g. a stale dfuUPLOAD-IDLE
    pub fn set_state(&mut self, state: DfuState, status: DfuStatus) {
        self.state = state;
        self.status = status;
    }

    /// Enable DfuSe read protection
    pub fn set_read_protected(&mut self, protected: bool) {
        self.read_protected = protected;
    }

    /// Make one DfuSe address always read back as `value`
    pub fn set_stuck_byte(&mut self, address: u32, value: u8) {
        self.stuck_byte = Some((address, value));
    }

    /// Fail the next data download with `status`
    pub fn fail_next_download(&mut self, status: DfuStatus) {
        self.fail_next_download = Some(status);
    }

    /// Make every further request fail as if the device was unplugged
    pub fn disconnect(&mut self) {
        self.disconnected = true;
    }

    fn error(&mut self, status: DfuStatus) {
        log::debug!("dummy: entering dfuERROR with {}", status);
        self.state = DfuState::DfuError;
        self.status = status;
    }

    fn memory_mut(&mut self) -> Option<&mut Memory> {
        self.memories.get_mut(self.alt_setting as usize)
    }

    fn get_status(&mut self) -> StatusResponse {
        match self.state {
            DfuState::DfuDnloadSync | DfuState::DfuDnbusy => {
                if self.busy_left > 0 {
                    self.busy_left -= 1;
                    self.state = DfuState::DfuDnbusy;
                } else {
                    self.state = DfuState::DfuDnloadIdle;
                }
            }
            DfuState::DfuManifestSync => {
                self.manifested = true;
                self.reenumerating = true;
                self.state = if self.config.attributes.contains(Attributes::MANIFEST_TOL) {
                    DfuState::DfuIdle
                } else {
                    DfuState::DfuManifestWaitReset
                };
            }
            _ => {}
        }
        StatusResponse {
            status: self.status,
            poll_timeout_ms: self.config.poll_timeout_ms,
            state: self.state,
            string_index: 0,
        }
    }

    fn dnload(&mut self, block: u16, data: &[u8]) -> Result<usize, TransportError> {
        match self.state {
            DfuState::DfuIdle | DfuState::DfuDnloadIdle => {}
            _ => {
                self.error(DfuStatus::ErrStalledPkt);
                return Err(TransportError::Stall);
            }
        }

        if self.config.dfuse && block == 0 {
            self.dfuse_command(data);
            return Ok(data.len());
        }
        if self.config.dfuse && block == 1 {
            self.error(DfuStatus::ErrStalledPkt);
            return Err(TransportError::Stall);
        }

        if data.is_empty() {
            self.state = DfuState::DfuManifestSync;
            return Ok(0);
        }

        if let Some(status) = self.fail_next_download.take() {
            self.error(status);
            return Ok(data.len());
        }

        let transfer_size = self.config.transfer_size as usize;
        let dfuse = self.config.dfuse;
        let pointer = self.address_pointer;
        let Some(mem) = self.memory_mut() else {
            self.error(DfuStatus::ErrTarget);
            return Ok(data.len());
        };

        if dfuse {
            let offset = (block - DFUSE_BLOCK_OFFSET) as u64 * transfer_size as u64;
            let address = pointer as u64 + offset;
            let range = u32::try_from(address)
                .ok()
                .and_then(|a| mem.range(a, data.len()));
            let Some(range) = range else {
                self.error(DfuStatus::ErrAddress);
                return Ok(data.len());
            };
            // flash can only clear bits
            for (dst, src) in mem.data[range].iter_mut().zip(data) {
                *dst &= *src;
            }
        } else {
            let offset = block as usize * transfer_size;
            if block == 0 {
                mem.data.clear();
            }
            if mem.data.len() < offset + data.len() {
                mem.data.resize(offset + data.len(), 0);
            }
            mem.data[offset..offset + data.len()].copy_from_slice(data);
        }

        self.state = DfuState::DfuDnloadSync;
        self.busy_left = self.config.busy_polls;
        Ok(data.len())
    }

    fn dfuse_command(&mut self, data: &[u8]) {
        self.state = DfuState::DfuDnloadSync;
        self.busy_left = self.config.busy_polls;

        match (data.first().copied(), le_address(data)) {
            (Some(DFUSE_CMD_SET_ADDRESS_POINTER), Some(address)) => {
                log::trace!("dummy: address pointer 0x{:08x}", address);
                self.address_pointer = address;
            }
            (Some(DFUSE_CMD_ERASE), Some(address)) => {
                if self.read_protected {
                    self.error(DfuStatus::ErrVendor);
                    return;
                }
                self.erased.push(address);
                let Some(mem) = self.memory_mut() else {
                    return;
                };
                let sector = mem.sectors.sector_for_address(address).map(|(_, s)| *s);
                let range = sector.and_then(|s| mem.range(s.address, s.size as usize));
                match range {
                    Some(range) => mem.data[range].fill(0xFF),
                    None => self.error(DfuStatus::ErrTarget),
                }
                // erasing takes an extra status round trip
                self.busy_left += 1;
            }
            (Some(DFUSE_CMD_READ_UNPROTECT), _) => {
                self.read_protected = false;
                if let Some(mem) = self.memory_mut() {
                    mem.data.fill(0xFF);
                }
            }
            _ => self.error(DfuStatus::ErrStalledPkt),
        }
    }

    fn upload(&mut self, block: u16, length: u16) -> Result<Vec<u8>, TransportError> {
        match self.state {
            DfuState::DfuIdle | DfuState::DfuUploadIdle => {}
            _ => {
                self.error(DfuStatus::ErrStalledPkt);
                return Err(TransportError::Stall);
            }
        }

        let transfer_size = self.config.transfer_size as usize;
        let len = (length as usize).min(transfer_size);
        let dfuse = self.config.dfuse;

        if dfuse && block == 0 {
            return Ok(vec![
                0x00,
                DFUSE_CMD_SET_ADDRESS_POINTER,
                DFUSE_CMD_ERASE,
                DFUSE_CMD_READ_UNPROTECT,
            ]);
        }
        if dfuse && (block == 1 || self.read_protected) {
            self.error(if self.read_protected {
                DfuStatus::ErrVendor
            } else {
                DfuStatus::ErrStalledPkt
            });
            return Err(TransportError::Stall);
        }

        let pointer = self.address_pointer;
        let stuck = self.stuck_byte;
        let Some(mem) = self.memories.get(self.alt_setting as usize) else {
            return Err(TransportError::Stall);
        };
        let (start, base_address) = if dfuse {
            let offset = (block - DFUSE_BLOCK_OFFSET) as u64 * transfer_size as u64;
            let address = pointer as u64 + offset;
            let Some(start) = address
                .checked_sub(mem.base as u64)
                .filter(|&s| s <= mem.data.len() as u64)
            else {
                self.error(DfuStatus::ErrAddress);
                return Err(TransportError::Stall);
            };
            (start as usize, address)
        } else {
            let start = (block as usize * transfer_size).min(mem.data.len());
            (start, start as u64)
        };

        let end = (start + len).min(mem.data.len());
        let mut out = mem.data[start..end].to_vec();
        if let Some((address, value)) = stuck {
            if let Some(idx) = (address as u64).checked_sub(base_address) {
                if let Some(b) = out.get_mut(idx as usize) {
                    *b = value;
                }
            }
        }

        self.state = if out.len() < transfer_size {
            DfuState::DfuIdle
        } else {
            DfuState::DfuUploadIdle
        };
        Ok(out)
    }

    fn log(&mut self, request: u8, value: u16, data: &[u8]) {
        self.requests.push(LoggedRequest {
            request,
            value,
            data: data.to_vec(),
        });
    }
}

fn le_address(data: &[u8]) -> Option<u32> {
    match data {
        [_, a, b, c, d, ..] => Some(u32::from_le_bytes([*a, *b, *c, *d])),
        _ => None,
    }
}

impl DfuTransport for DummyDfu {
    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        _index: u16,
        length: u16,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if self.disconnected {
            return Err(TransportError::Disconnected);
        }
        self.log(request, value, &[]);

        if request == Request::GetStatus.code() {
            let status = self.get_status();
            Ok(status.to_bytes()[..(length as usize).min(6)].to_vec())
        } else if request == Request::GetState.code() {
            Ok(vec![self.state.as_u8()])
        } else if request == Request::Upload.code() && !self.runtime {
            self.upload(value, length)
        } else {
            Err(TransportError::Stall)
        }
    }

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        _index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if self.disconnected {
            return Err(TransportError::Disconnected);
        }
        self.log(request, value, data);

        match request {
            r if r == Request::Dnload.code() && !self.runtime => self.dnload(value, data),
            r if r == Request::Abort.code() => {
                self.state = DfuState::DfuIdle;
                Ok(0)
            }
            r if r == Request::ClrStatus.code() => {
                self.state = DfuState::DfuIdle;
                self.status = DfuStatus::Ok;
                Ok(0)
            }
            r if r == Request::Detach.code() && self.runtime => {
                self.state = DfuState::AppDetach;
                if self.config.attributes.contains(Attributes::WILL_DETACH) {
                    self.enter_dfu();
                    self.reenumerating = true;
                }
                Ok(0)
            }
            _ => Err(TransportError::Stall),
        }
    }

    fn usb_ids(&self) -> UsbIds {
        let pid = match self.config.runtime_pid {
            Some(pid) if self.runtime => pid,
            _ => self.config.pid,
        };
        UsbIds {
            vid: self.config.vid,
            pid,
            release: self.config.release,
        }
    }

    fn interfaces(&self) -> Vec<DfuInterface> {
        let version = if self.config.dfuse {
            DFU_VERSION_DFUSE
        } else {
            DFU_VERSION_DFU_1_0
        };
        let detach = self.config.detach_timeout.to_le_bytes();
        let xfer = self.config.transfer_size.to_le_bytes();
        let ver = version.to_le_bytes();
        let functional_descriptor = vec![
            9,
            DFU_FUNCTIONAL_DESCRIPTOR_TYPE,
            self.config.attributes.bits(),
            detach[0],
            detach[1],
            xfer[0],
            xfer[1],
            ver[0],
            ver[1],
        ];

        (0..self.config.alt_names.len())
            .map(|i| DfuInterface {
                number: 0,
                alt_setting: i as u8,
                protocol: if self.runtime { 0x01 } else { 0x02 },
                name_index: i as u8 + 1,
                functional_descriptor: functional_descriptor.clone(),
            })
            .collect()
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        if self.disconnected {
            return Err(TransportError::Disconnected);
        }
        self.claimed = Some(interface);
        Ok(())
    }

    fn set_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        if self.claimed != Some(interface) {
            return Err(TransportError::Other(format!(
                "interface {} not claimed",
                interface
            )));
        }
        if alt_setting as usize >= self.memories.len() {
            return Err(TransportError::Stall);
        }
        self.alt_setting = alt_setting;
        Ok(())
    }

    fn string_descriptor(&mut self, index: u8) -> Result<String, TransportError> {
        index
            .checked_sub(1)
            .and_then(|i| self.config.alt_names.get(i as usize))
            .cloned()
            .ok_or(TransportError::Stall)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        if self.disconnected {
            return Err(TransportError::Disconnected);
        }
        self.resets += 1;
        self.reenumerating = true;
        if self.runtime {
            self.enter_dfu();
        } else {
            self.runtime = true;
            self.state = DfuState::AppIdle;
        }
        Ok(())
    }

    fn wait_for_replug(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        if !self.reenumerating {
            return Err(TransportError::Timeout);
        }
        self.reenumerating = false;
        let ids = self.usb_ids();
        self.enumerated_as.check_replugged(&ids)?;
        self.enumerated_as = ids;
        Ok(())
    }

    fn delay(&mut self, duration: Duration) {
        self.delayed += duration;
    }
}

impl DummyDfu {
    fn enter_dfu(&mut self) {
        self.runtime = false;
        self.state = DfuState::DfuIdle;
        self.status = DfuStatus::Ok;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interfaces() {
        let dev = DummyDfu::new(DummyConfig::dfuse());
        let ifaces = dev.interfaces();
        assert_eq!(ifaces.len(), 1);
        assert_eq!(ifaces[0].protocol, 2);
        assert_eq!(&ifaces[0].functional_descriptor[7..9], &[0x1a, 0x01]);
    }

    #[test]
    fn test_memory_from_sector_map() {
        let dev = DummyDfu::new(DummyConfig::dfuse());
        assert_eq!(dev.memory(0).len(), 16 * 1024);
        assert!(dev.read(0x0800_0000, 4).is_some());
        assert!(dev.read(0x0800_4000, 1).is_none());
    }

    #[test]
    fn test_status_cycle() {
        let mut dev = DummyDfu::new_default();
        let t = Duration::from_millis(100);
        dev.control_out(Request::Dnload.code(), 0, 0, &[1, 2, 3], t)
            .unwrap();
        assert_eq!(dev.state(), DfuState::DfuDnloadSync);
        let status = dev
            .control_in(Request::GetStatus.code(), 0, 0, 6, t)
            .unwrap();
        assert_eq!(status[4], DfuState::DfuDnloadIdle.as_u8());
        assert_eq!(dev.memory(0), &[1, 2, 3]);
    }

    #[test]
    fn test_dfuse_write_needs_erase() {
        let mut dev = DummyDfu::new(DummyConfig::dfuse());
        let t = Duration::from_millis(100);
        let set = [DFUSE_CMD_SET_ADDRESS_POINTER, 0x00, 0x00, 0x00, 0x08];
        dev.control_out(Request::Dnload.code(), 0, 0, &set, t).unwrap();
        dev.control_in(Request::GetStatus.code(), 0, 0, 6, t).unwrap();
        dev.control_out(Request::Dnload.code(), 2, 0, &[0x0f], t)
            .unwrap();
        dev.control_in(Request::GetStatus.code(), 0, 0, 6, t).unwrap();
        dev.control_out(Request::Dnload.code(), 2, 0, &[0xf0], t)
            .unwrap();
        assert_eq!(dev.read(0x0800_0000, 1), Some(&[0x00][..]));
    }
}
