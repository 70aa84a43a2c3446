//! Sensor error types
//!
//! One enum covers the whole core: transport state, USB open failures (kept
//! distinguishable so callers can suggest a fix), endpoint timeouts, protocol
//! validation and discovery.

use protocol::ProtocolError;
use thiserror::Error;

/// Why a transport could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OpenFailure {
    /// Another driver holds the device or interface
    #[error("device or resource busy")]
    Busy,

    /// The platform driver does not support the operation
    #[error("operation not supported by the installed driver")]
    Unsupported,

    /// No device with the requested ids (and location) is attached
    #[error("no matching device attached")]
    NotFound,

    /// Insufficient permissions on the device node
    #[error("access denied")]
    Access,

    /// Any other USB failure
    #[error("{0}")]
    Other(rusb::Error),
}

impl OpenFailure {
    /// Classify a USB error raised while opening
    pub fn from_usb(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Busy => OpenFailure::Busy,
            rusb::Error::NotSupported => OpenFailure::Unsupported,
            rusb::Error::NotFound | rusb::Error::NoDevice => OpenFailure::NotFound,
            rusb::Error::Access => OpenFailure::Access,
            other => OpenFailure::Other(other),
        }
    }

    /// Hint a caller can show the user
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            OpenFailure::Busy => Some("Try to rmmod cdc_acm."),
            OpenFailure::Unsupported if cfg!(windows) => Some("Try to uninstall Apogee drivers."),
            OpenFailure::Access => Some("Check the udev rules for the device or run with USB access."),
            _ => None,
        }
    }
}

/// Errors raised by the sensor core
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted before open or after close
    #[error("device is not opened")]
    NotOpen,

    /// A closed transport cannot be reopened
    #[error("transport is closed")]
    TransportClosed,

    /// Opening the USB device failed
    #[error("failed to open device: {0}")]
    Open(#[from] OpenFailure),

    /// Endpoint operation exceeded its timeout
    #[error("USB transfer timed out")]
    Timeout,

    /// Other USB failure during a transfer
    #[error("USB error: {0}")]
    Usb(rusb::Error),

    /// Response failed validation or decoding
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Discovery found no sensor
    #[error("no device found")]
    NoDevice,

    /// The registry has been shut down
    #[error("registry is closed")]
    RegistryClosed,

    /// Thread or OS failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => Error::Timeout,
            other => Error::Usb(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
