//! DFU and DfuSe wire constants
//!
//! Request codes, the device state machine and the status codes returned by
//! `DFU_GETSTATUS`, as defined by the USB DFU 1.1 class specification and
//! ST's DfuSe extension (UM0391).

use std::fmt;

/// DFU class requests (bRequest)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Request {
    /// Leave runtime mode and wait for a USB reset
    Detach = 0x00,
    /// Send a block of firmware to the device
    Dnload = 0x01,
    /// Read a block of firmware from the device
    Upload = 0x02,
    /// Read the 6-byte status structure
    GetStatus = 0x03,
    /// Leave the dfuERROR state
    ClrStatus = 0x04,
    /// Read the current state byte
    GetState = 0x05,
    /// Return to dfuIDLE
    Abort = 0x06,
}

impl Request {
    /// Raw request code
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// DfuSe vendor command: set the address pointer
pub const DFUSE_CMD_SET_ADDRESS_POINTER: u8 = 0x21;
/// DfuSe vendor command: erase the page containing an address
pub const DFUSE_CMD_ERASE: u8 = 0x41;
/// DfuSe vendor command: read-unprotect (mass erase)
pub const DFUSE_CMD_READ_UNPROTECT: u8 = 0x92;

/// wBlockNum offset for data blocks on DfuSe devices
///
/// Blocks 0 and 1 carry vendor commands.
pub const DFUSE_BLOCK_OFFSET: u16 = 2;

/// Size of the GETSTATUS response
pub const GETSTATUS_LEN: usize = 6;

/// DFU device state (bState)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    /// Device is running its normal application
    AppIdle,
    /// Device received DFU_DETACH and waits for a USB reset
    AppDetach,
    /// Device is in DFU mode and waits for requests
    DfuIdle,
    /// Device received a block and waits for GETSTATUS
    DfuDnloadSync,
    /// Device is programming a block
    DfuDnbusy,
    /// Device expects more DNLOAD requests
    DfuDnloadIdle,
    /// Device received the final block and waits for GETSTATUS to manifest
    DfuManifestSync,
    /// Device is in the manifestation phase
    DfuManifest,
    /// Device programmed its memories and waits for a reset
    DfuManifestWaitReset,
    /// Device is processing an upload
    DfuUploadIdle,
    /// An error occurred, awaiting CLRSTATUS
    DfuError,
    /// Value outside the defined range
    Unknown(u8),
}

impl DfuState {
    /// Decode a bState byte
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::DfuIdle,
            3 => DfuState::DfuDnloadSync,
            4 => DfuState::DfuDnbusy,
            5 => DfuState::DfuDnloadIdle,
            6 => DfuState::DfuManifestSync,
            7 => DfuState::DfuManifest,
            8 => DfuState::DfuManifestWaitReset,
            9 => DfuState::DfuUploadIdle,
            10 => DfuState::DfuError,
            other => DfuState::Unknown(other),
        }
    }

    /// Encode as a bState byte
    pub fn as_u8(self) -> u8 {
        match self {
            DfuState::AppIdle => 0,
            DfuState::AppDetach => 1,
            DfuState::DfuIdle => 2,
            DfuState::DfuDnloadSync => 3,
            DfuState::DfuDnbusy => 4,
            DfuState::DfuDnloadIdle => 5,
            DfuState::DfuManifestSync => 6,
            DfuState::DfuManifest => 7,
            DfuState::DfuManifestWaitReset => 8,
            DfuState::DfuUploadIdle => 9,
            DfuState::DfuError => 10,
            DfuState::Unknown(other) => other,
        }
    }

    /// Short name as used in the DFU specification
    pub fn as_str(self) -> &'static str {
        match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DfuDnloadSync => "dfuDNLOAD-SYNC",
            DfuState::DfuDnbusy => "dfuDNBUSY",
            DfuState::DfuDnloadIdle => "dfuDNLOAD-IDLE",
            DfuState::DfuManifestSync => "dfuMANIFEST-SYNC",
            DfuState::DfuManifest => "dfuMANIFEST",
            DfuState::DfuManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            DfuState::DfuUploadIdle => "dfuUPLOAD-IDLE",
            DfuState::DfuError => "dfuERROR",
            DfuState::Unknown(_) => "unknown",
        }
    }

    /// The device is still busy and GETSTATUS must be polled again
    pub fn is_busy(self) -> bool {
        matches!(self, DfuState::DfuDnbusy | DfuState::DfuManifest)
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::Unknown(v) => write!(f, "unknown(0x{:02x})", v),
            other => f.write_str(other.as_str()),
        }
    }
}

/// DFU status code (bStatus)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuStatus {
    /// No error condition is present
    Ok,
    /// File is not targeted for use by this device
    ErrTarget,
    /// File fails a vendor-specific verification test
    ErrFile,
    /// Device is unable to write memory
    ErrWrite,
    /// Memory erase function failed
    ErrErase,
    /// Memory erase check failed
    ErrCheckErased,
    /// Program memory function failed
    ErrProg,
    /// Programmed memory failed verification
    ErrVerify,
    /// Received address is out of range
    ErrAddress,
    /// Zero-length DNLOAD received before all data
    ErrNotDone,
    /// Firmware is corrupt and cannot return to runtime
    ErrFirmware,
    /// iString indicates a vendor-specific error
    ErrVendor,
    /// Unexpected USB reset signalling
    ErrUsbr,
    /// Unexpected power on reset
    ErrPor,
    /// Something went wrong
    ErrUnknown,
    /// Device stalled an unexpected request
    ErrStalledPkt,
    /// Value outside the defined range
    Unknown(u8),
}

impl DfuStatus {
    /// Decode a bStatus byte
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => DfuStatus::Ok,
            0x01 => DfuStatus::ErrTarget,
            0x02 => DfuStatus::ErrFile,
            0x03 => DfuStatus::ErrWrite,
            0x04 => DfuStatus::ErrErase,
            0x05 => DfuStatus::ErrCheckErased,
            0x06 => DfuStatus::ErrProg,
            0x07 => DfuStatus::ErrVerify,
            0x08 => DfuStatus::ErrAddress,
            0x09 => DfuStatus::ErrNotDone,
            0x0a => DfuStatus::ErrFirmware,
            0x0b => DfuStatus::ErrVendor,
            0x0c => DfuStatus::ErrUsbr,
            0x0d => DfuStatus::ErrPor,
            0x0e => DfuStatus::ErrUnknown,
            0x0f => DfuStatus::ErrStalledPkt,
            other => DfuStatus::Unknown(other),
        }
    }

    /// Encode as a bStatus byte
    pub fn as_u8(self) -> u8 {
        match self {
            DfuStatus::Ok => 0x00,
            DfuStatus::ErrTarget => 0x01,
            DfuStatus::ErrFile => 0x02,
            DfuStatus::ErrWrite => 0x03,
            DfuStatus::ErrErase => 0x04,
            DfuStatus::ErrCheckErased => 0x05,
            DfuStatus::ErrProg => 0x06,
            DfuStatus::ErrVerify => 0x07,
            DfuStatus::ErrAddress => 0x08,
            DfuStatus::ErrNotDone => 0x09,
            DfuStatus::ErrFirmware => 0x0a,
            DfuStatus::ErrVendor => 0x0b,
            DfuStatus::ErrUsbr => 0x0c,
            DfuStatus::ErrPor => 0x0d,
            DfuStatus::ErrUnknown => 0x0e,
            DfuStatus::ErrStalledPkt => 0x0f,
            DfuStatus::Unknown(other) => other,
        }
    }

    /// Short name as used in the DFU specification
    pub fn as_str(self) -> &'static str {
        match self {
            DfuStatus::Ok => "OK",
            DfuStatus::ErrTarget => "errTARGET",
            DfuStatus::ErrFile => "errFILE",
            DfuStatus::ErrWrite => "errWRITE",
            DfuStatus::ErrErase => "errERASE",
            DfuStatus::ErrCheckErased => "errCHECK_ERASED",
            DfuStatus::ErrProg => "errPROG",
            DfuStatus::ErrVerify => "errVERIFY",
            DfuStatus::ErrAddress => "errADDRESS",
            DfuStatus::ErrNotDone => "errNOTDONE",
            DfuStatus::ErrFirmware => "errFIRMWARE",
            DfuStatus::ErrVendor => "errVENDOR",
            DfuStatus::ErrUsbr => "errUSBR",
            DfuStatus::ErrPor => "errPOR",
            DfuStatus::ErrUnknown => "errUNKNOWN",
            DfuStatus::ErrStalledPkt => "errSTALLDPKT",
            DfuStatus::Unknown(_) => "unknown",
        }
    }

    /// Human-readable description of the status
    pub fn description(self) -> &'static str {
        match self {
            DfuStatus::Ok => "no error condition is present",
            DfuStatus::ErrTarget => "file is not targeted for use by this device",
            DfuStatus::ErrFile => "file fails a vendor-specific verification test",
            DfuStatus::ErrWrite => "device is unable to write memory",
            DfuStatus::ErrErase => "memory erase function failed",
            DfuStatus::ErrCheckErased => "memory erase check failed",
            DfuStatus::ErrProg => "program memory function failed",
            DfuStatus::ErrVerify => "programmed memory failed verification",
            DfuStatus::ErrAddress => "received address is out of range",
            DfuStatus::ErrNotDone => "received zero-length download before all data",
            DfuStatus::ErrFirmware => "device firmware is corrupt",
            DfuStatus::ErrVendor => "vendor-specific error",
            DfuStatus::ErrUsbr => "device detected unexpected USB reset",
            DfuStatus::ErrPor => "device detected unexpected power on reset",
            DfuStatus::ErrUnknown => "unknown failure",
            DfuStatus::ErrStalledPkt => "device stalled an unexpected request",
            DfuStatus::Unknown(_) => "unrecognised status code",
        }
    }
}

impl fmt::Display for DfuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuStatus::Unknown(v) => write!(f, "unknown(0x{:02x})", v),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Decoded GETSTATUS response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    /// bStatus
    pub status: DfuStatus,
    /// bwPollTimeout in milliseconds (24-bit)
    pub poll_timeout_ms: u32,
    /// bState
    pub state: DfuState,
    /// iString
    pub string_index: u8,
}

impl StatusResponse {
    /// Decode the 6-byte GETSTATUS payload
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < GETSTATUS_LEN {
            return None;
        }
        Some(Self {
            status: DfuStatus::from_u8(buf[0]),
            poll_timeout_ms: u32::from_le_bytes([buf[1], buf[2], buf[3], 0]),
            state: DfuState::from_u8(buf[4]),
            string_index: buf[5],
        })
    }

    /// Encode as the 6-byte GETSTATUS payload
    pub fn to_bytes(&self) -> [u8; GETSTATUS_LEN] {
        let timeout = self.poll_timeout_ms.to_le_bytes();
        [
            self.status.as_u8(),
            timeout[0],
            timeout[1],
            timeout[2],
            self.state.as_u8(),
            self.string_index,
        ]
    }
}

/// Build a DfuSe vendor command payload: opcode followed by a LE address
pub fn dfuse_command(opcode: u8, address: u32) -> [u8; 5] {
    let a = address.to_le_bytes();
    [opcode, a[0], a[1], a[2], a[3]]
}
