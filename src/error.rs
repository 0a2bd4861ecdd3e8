//! Our error types for the power supply bus.
//!
//! Errors below the upward API carry [`embedded_io::ErrorKind`] rather than the
//! driver's own error type so they stay `Copy` and can cross scan threads.

use embedded_io::ErrorKind;
use thiserror::Error;

use crate::codec::Command;
use crate::property::Reading;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A received byte sequence could not be turned into a frame.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Checksum mismatch")]
    Checksum,
    #[error("Malformed frame: {0}")]
    Malformed(&'static str),
    #[error("Unknown command byte 0x{0:02X}")]
    UnknownCommand(u8),
}

/// Raw I/O failure on the physical channel.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No complete frame arrived before the deadline. Recoverable.
    #[error("Communication timeout")]
    Timeout,
    /// The underlying driver failed. Fatal for the channel.
    #[error("Channel fault: {0:?}")]
    Fault(ErrorKind),
    /// The channel was dropped after a fault and has not been reopened.
    #[error("Channel closed")]
    Closed,
}

impl TransportError {
    /// Whether this error takes the whole channel down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Timeout)
    }
}

/// Outcome of one coordinated round trip.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Device 0x{0:02X} is unresponsive")]
    Unresponsive(u8),
    #[error("Channel fault: {0:?}")]
    ChannelFault(ErrorKind),
    /// The device answered with a protocol error code.
    #[error("Device 0x{address:02X} rejected the request: {code:?}")]
    Rejected { address: u8, code: Command },
    /// A multi-frame transfer was abandoned between frames.
    #[error("Transfer cancelled")]
    Cancelled,
}

impl From<TransportError> for ChannelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Fault(kind) => ChannelError::ChannelFault(kind),
            TransportError::Closed => ChannelError::ChannelFault(ErrorKind::NotConnected),
            // Timeouts are resolved by the retry policy before reaching here.
            TransportError::Timeout => ChannelError::ChannelFault(ErrorKind::TimedOut),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadError {
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),
    #[error("Property '{0}' is not available on this device model")]
    UnknownProperty(String),
    #[error("Property '{0}' cannot be read")]
    WriteOnly(&'static str),
    /// The device is not connected. The last good value, if any, is returned tagged as stale.
    #[error("Device unavailable")]
    Unavailable { last: Option<Reading> },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WriteError {
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),
    #[error("Property '{0}' is not available on this device model")]
    UnknownProperty(String),
    #[error("Property '{0}' is read-only")]
    ReadOnly(&'static str),
    #[error("Invalid value for '{property}': {reason}")]
    InvalidValue {
        property: &'static str,
        reason: &'static str,
    },
    #[error("Value {value} for '{property}' outside limits [{low}, {high}]")]
    LimitExceeded {
        property: &'static str,
        value: f64,
        low: f64,
        high: f64,
    },
    #[error("Device '{0}' is unavailable")]
    DeviceUnavailable(String),
    /// The device accepted the frame but answered with a protocol error.
    #[error("Device '{0}' rejected the write")]
    Rejected(String),
    #[error("Scan loop is no longer accepting writes")]
    QueueClosed,
}

/// Configuration loading failures.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(String),
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Start-up and shutdown failures of the whole facility.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to open channel '{channel}': {source}")]
    Connect {
        channel: String,
        source: TransportError,
    },
    #[error("Failed to spawn scan thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Scan thread for channel '{0}' panicked")]
    Panicked(String),
}
