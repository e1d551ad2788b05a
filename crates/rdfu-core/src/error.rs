//! Error types for rdfu-core
//!
//! Container and descriptor decoding each have their own error type so the
//! codec can be used without pulling in transfer concepts. [`Error`] wraps
//! them all and adds the failures of the transfer engine.

use thiserror::Error;

use crate::protocol::DfuStatus;
use crate::transport::TransportError;

/// Broad classification of an error, independent of where it was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed container: bad signature, version, checksum or field size
    InvalidFile,
    /// Operation not valid for this format or device
    NotSupported,
    /// USB-level failure, disconnect, timeout or wrong device
    InvalidDevice,
    /// No sector, target or image matches the request
    NotFound,
    /// Post-write readback mismatch
    VerifyFailed,
    /// Protocol-state violation that should be unreachable
    Internal,
    /// The caller cancelled the transfer
    Cancelled,
}

/// Errors raised while decoding a firmware container
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Footer version is neither DFU 1.0 nor DfuSe
    #[error("version check failed, got 0x{0:04x}")]
    BadVersion(u16),

    /// Footer CRC does not match the file contents
    #[error("CRC failed, expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumFailed {
        /// CRC computed over the file
        expected: u32,
        /// CRC stored in the footer
        actual: u32,
    },

    /// Footer length field is larger than the file or smaller than the footer
    #[error("footer length 0x{footer_len:02x} invalid for file of 0x{file_len:x} bytes")]
    TruncatedFooter {
        /// Value of the footer `len` field
        footer_len: u8,
        /// Total size of the file
        file_len: usize,
    },

    /// Metadata table is malformed
    #[error("metadata table corrupt: {0}")]
    CorruptMetadata(String),

    /// DfuSe prefix has a bad signature, version or size
    #[error("invalid DfuSe prefix: {0}")]
    BadDfuSePrefix(String),

    /// DfuSe target or element header is malformed
    #[error("invalid DfuSe image: {0}")]
    BadDfuSeImage(String),

    /// Intel-HEX record type is not supported
    #[error("invalid record type 0x{record_type:02x} at line {line}")]
    UnknownRecordType {
        /// The offending record type
        record_type: u8,
        /// One-based line number
        line: usize,
    },

    /// Intel-HEX record is not well-formed
    #[error("invalid Intel-HEX syntax at line {line}: {reason}")]
    InvalidHexSyntax {
        /// One-based line number
        line: usize,
        /// What was wrong
        reason: String,
    },

    /// Intel-HEX record checksum mismatch
    #[error("invalid checksum at line {line}, got 0x{actual:02x}, expected 0x{expected:02x}")]
    HexChecksum {
        /// One-based line number
        line: usize,
        /// Checksum computed over the record
        expected: u8,
        /// Checksum stored in the record
        actual: u8,
    },

    /// Intel-HEX data records go backwards or leave an implausible hole
    #[error("Intel-HEX address 0x{address:08x} at line {line} is not usable: {reason}")]
    BadHexAddress {
        /// One-based line number
        line: usize,
        /// Absolute address of the record
        address: u32,
        /// What was wrong
        reason: &'static str,
    },

    /// Input ended before the structure was complete (e.g. no EOF record)
    #[error("file truncated: {0}")]
    Truncated(String),

    /// More than one Intel-HEX EOF record
    #[error("duplicate EOF record at line {0}")]
    DuplicateEof(usize),
}

/// Errors raised while encoding a firmware container
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// Format only allows a single image
    #[error("{format} only supports one image, got {count}")]
    TooManyImages {
        /// Format being written
        format: &'static str,
        /// Number of images in the firmware
        count: usize,
    },

    /// Firmware has no image, or the image has the wrong number of elements
    #[error("{0}")]
    WrongElementCount(String),

    /// Metadata does not fit into the table
    #[error("metadata table too large: {0}")]
    MetadataTooLarge(String),

    /// Element or image is too large for a 32-bit field
    #[error("{0} is too large for the container")]
    TooLarge(&'static str),

    /// Format cannot be written by this crate
    #[error("writing {0} firmware is not supported")]
    UnsupportedFormat(&'static str),
}

/// Errors raised while parsing a DfuSe alternate-setting name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SectorMapError {
    /// A numeric field could not be parsed
    #[error("invalid number '{0}' in sector map")]
    InvalidNumber(String),

    /// Sector token lacks the multiplier or type suffix
    #[error("sector token '{0}' has no {1} suffix")]
    MissingSuffix(String, &'static str),

    /// Multiplier or type letter is not recognised
    #[error("sector token '{0}' has unknown {1} '{2}'")]
    UnknownSuffix(String, &'static str, char),

    /// Address group is not followed by a sector list
    #[error("no sector list after address 0x{0:08x}")]
    MissingSectors(u32),

    /// Sector count or size is zero or above 999
    #[error("sector token '{0}' has {1} out of range")]
    OutOfRange(String, &'static str),

    /// Sector sizes overflow the 32-bit address space
    #[error("sector map at 0x{0:08x} overflows the address space")]
    Overflow(u32),
}

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Firmware container could not be decoded
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Firmware container could not be encoded
    #[error(transparent)]
    Write(#[from] WriteError),

    /// DfuSe sector map could not be decoded
    #[error(transparent)]
    SectorMap(#[from] SectorMapError),

    /// USB request failed
    #[error("{context}: {source}")]
    Transport {
        /// What the engine was doing
        context: String,
        /// The transport failure
        #[source]
        source: TransportError,
    },

    /// Device reported an error status
    #[error("device status {status}: {message}")]
    DeviceStatus {
        /// Status reported by GETSTATUS
        status: DfuStatus,
        /// Human-readable description
        message: &'static str,
    },

    /// No sector covers the requested address
    #[error("no sector found for address 0x{0:08x}")]
    NoSectorAtAddress(u32),

    /// Sector does not have the writeable capability
    #[error("sector at 0x{0:08x} is not writable")]
    SectorNotWritable(u32),

    /// Sector does not have the readable capability
    #[error("sector at 0x{0:08x} is not readable")]
    SectorNotReadable(u32),

    /// Readback after download did not match
    #[error("verify failed: {0}")]
    VerifyFailed(String),

    /// Upload size differs from the expected size
    #[error("invalid size, got {actual}, expected {expected}")]
    SizeMismatch {
        /// Size the caller asked for
        expected: usize,
        /// Size actually read
        actual: usize,
    },

    /// Operation not supported by this target or format
    #[error("not supported: {0}")]
    NotSupported(String),

    /// No matching target, image or device
    #[error("not found: {0}")]
    NotFound(String),

    /// Device descriptor or state is not usable
    #[error("invalid device: {0}")]
    InvalidDevice(String),

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Protocol state violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a transport failure with the operation that caused it
    pub fn transport(context: impl Into<String>, source: TransportError) -> Self {
        Error::Transport {
            context: context.into(),
            source,
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Parse(_) | Error::SectorMap(_) => ErrorKind::InvalidFile,
            Error::Write(WriteError::WrongElementCount(_)) => ErrorKind::Internal,
            Error::Write(_) => ErrorKind::NotSupported,
            Error::Transport { .. } | Error::DeviceStatus { .. } | Error::InvalidDevice(_) => {
                ErrorKind::InvalidDevice
            }
            Error::SizeMismatch { .. } => ErrorKind::InvalidFile,
            Error::NoSectorAtAddress(_) | Error::NotFound(_) => ErrorKind::NotFound,
            Error::SectorNotWritable(_) | Error::SectorNotReadable(_) | Error::NotSupported(_) => {
                ErrorKind::NotSupported
            }
            Error::VerifyFailed(_) => ErrorKind::VerifyFailed,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result type alias using the core Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            Error::from(ParseError::BadVersion(0x0200)).kind(),
            ErrorKind::InvalidFile
        );
        assert_eq!(
            Error::from(WriteError::TooManyImages {
                format: "DFU 1.0",
                count: 2
            })
            .kind(),
            ErrorKind::NotSupported
        );
        assert_eq!(
            Error::transport("cannot get status", TransportError::Timeout).kind(),
            ErrorKind::InvalidDevice
        );
        assert_eq!(Error::NoSectorAtAddress(0).kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::VerifyFailed("x".into()).kind(),
            ErrorKind::VerifyFailed
        );
    }

    #[test]
    fn test_transport_context_in_message() {
        let err = Error::transport(
            "cannot download chunk 3 at 0x08000000",
            TransportError::Stall,
        );
        let msg = err.to_string();
        assert!(msg.starts_with("cannot download chunk 3 at 0x08000000"));
        assert!(msg.contains("stall"));
    }
}
