//! Error types for the nusb transport

use thiserror::Error;

/// Result type for nusb transport operations
pub type Result<T> = std::result::Result<T, NusbError>;

/// Errors raised while finding or opening a DFU device
#[derive(Debug, Error)]
pub enum NusbError {
    /// No matching device is connected
    #[error("No DFU capable USB device found")]
    DeviceNotFound,

    /// More than one device matches and no filter picks one
    #[error("Found {0} DFU devices, narrow the selection with vid/pid/serial/bus/address")]
    MultipleDevicesFound(usize),

    /// Listing USB devices failed
    #[error("Failed to enumerate USB devices: {0}")]
    EnumerationFailed(String),

    /// Opening the device failed
    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    /// The active configuration could not be read
    #[error("Failed to read configuration descriptor: {0}")]
    ConfigFailed(String),

    /// Invalid device option
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}
