//! # Error Handling
//!
//! Error taxonomy for the RTU slave bank.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **Frame errors** ([`FrameError`]): truncated frames and CRC mismatches. These are
//!   dropped silently on the wire because the slave address itself cannot be trusted.
//! - **I/O / connection errors**: serial endpoint failures that drive the transport loop
//!   into its degraded state and, eventually, failover.
//!
//! ### Protocol Errors
//! - [`AddressError`] and [`FileError`] are raised by the register store and answered with a
//!   well-formed Modbus exception response (see [`crate::protocol::ExceptionCode`]).
//!
//! ### Configuration Errors
//! - [`RegistryError`] is returned synchronously to collaborators (duplicate or unknown slave ids).
//! - [`ModbusError::Configuration`] reports invalid configuration files.
//!
//! Resource errors (over-temperature, low memory) never surface as errors at all; the health
//! supervisor handles them locally by throttling.

use thiserror::Error;

use crate::protocol::{ExceptionCode, SlaveId};

/// Result type alias for crate operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Umbrella error type for server-level operations.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// I/O related errors (serial port reads/writes, snapshot files)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Serial endpoint could not be opened or was lost
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Operation exceeded its time budget
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Malformed RTU frame
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Slave registry failure
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable (a retry or rebind might succeed)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. } | Self::Frame(_)
        )
    }

    /// Check if the error is a serial transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

/// RTU framing failures detected by the frame codec.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the smallest possible frame (address + function + CRC)
    #[error("frame too short: {len} bytes")]
    TooShort { len: usize },

    /// Not enough bytes for the declared function code's header or byte count
    #[error("frame truncated: function 0x{function:02X} needs {needed} bytes, got {len}")]
    Truncated { function: u8, needed: usize, len: usize },

    /// Frame exceeds the RTU ADU limit
    #[error("frame too long: {len} bytes")]
    TooLong { len: usize },

    /// Trailing CRC does not match the computed CRC
    #[error("CRC mismatch: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },
}

/// Register space access failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    /// An address in the requested range is not populated
    #[error("illegal data address: start={start}, count={count}")]
    IllegalAddress { start: u16, count: u16 },

    /// Value or quantity is not acceptable for the register space
    #[error("illegal data value: {reason}")]
    IllegalValue { reason: &'static str },
}

/// File record access failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    #[error("unknown file {file_number}")]
    UnknownFile { file_number: u16 },

    #[error("unknown record {record_number} in file {file_number}")]
    UnknownRecord { file_number: u16, record_number: u16 },

    /// Stored record holds fewer bytes than `word_count * 2`
    #[error("record too short: {available} bytes stored, {requested} requested")]
    RecordTooShort { available: usize, requested: usize },
}

/// Failures of collaborator-facing registry operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("slave {0} already exists")]
    DuplicateSlaveId(SlaveId),

    #[error("slave {0} not found")]
    UnknownSlave(SlaveId),

    #[error("slave id {0} outside 1-247")]
    InvalidSlaveId(SlaveId),

    #[error("maximum number of slaves ({max}) reached")]
    CapacityExceeded { max: usize },
}

/// Error returned by `update_register`: either the slave is unknown or the store rejected the write.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Address(#[from] AddressError),
}

impl From<AddressError> for ExceptionCode {
    fn from(err: AddressError) -> Self {
        match err {
            AddressError::IllegalAddress { .. } => ExceptionCode::IllegalDataAddress,
            AddressError::IllegalValue { .. } => ExceptionCode::IllegalDataValue,
        }
    }
}

impl From<FileError> for ExceptionCode {
    fn from(_: FileError) -> Self {
        ExceptionCode::IllegalDataAddress
    }
}
