//! # Device Limits Configuration
//!
//! Per-slave quantity limits enforced by the register store.
//!
//! ## Modbus Specification Limits
//!
//! - **Read Holding/Input Registers (FC03/04)**: Max 125 registers per request
//! - **Read Coils/Discrete Inputs (FC01/02)**: Max 2000 bits per request
//! - **Write Multiple Registers (FC16)**: Max 123 registers per request
//! - **Write Multiple Coils (FC15)**: Max 1968 coils per request
//!
//! A simulated device profile may be stricter than the specification. Limits can
//! be lowered per slave but never raised above the protocol maxima.

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS};
use crate::error::AddressError;

/// Default maximum registers per read operation (Modbus specification).
pub const DEFAULT_MAX_READ_REGISTERS: u16 = MAX_READ_REGISTERS as u16;

/// Default maximum registers per write operation (Modbus specification).
pub const DEFAULT_MAX_WRITE_REGISTERS: u16 = MAX_WRITE_REGISTERS as u16;

/// Default maximum coils per read operation (Modbus specification).
pub const DEFAULT_MAX_READ_COILS: u16 = MAX_READ_COILS as u16;

/// Default maximum coils per write operation (Modbus specification).
pub const DEFAULT_MAX_WRITE_COILS: u16 = MAX_WRITE_COILS as u16;

/// Device-specific Modbus quantity limits.
///
/// # Example
///
/// ```rust
/// use rtu_slave_bank::DeviceLimits;
///
/// // A device profile that only serves 50 registers per read
/// let limits = DeviceLimits::new().with_max_read_registers(50);
/// assert_eq!(limits.max_read_registers, 50);
///
/// // Limits never exceed the protocol maximum
/// let limits = DeviceLimits::new().with_max_read_registers(500);
/// assert_eq!(limits.max_read_registers, 125);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLimits {
    /// Maximum registers per read request.
    pub max_read_registers: u16,
    /// Maximum registers per write request.
    pub max_write_registers: u16,
    /// Maximum coils per read request.
    pub max_read_coils: u16,
    /// Maximum coils per write request.
    pub max_write_coils: u16,
}

impl DeviceLimits {
    /// Create new device limits with default (Modbus spec) values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create limits for a conservative/slow device.
    pub fn conservative() -> Self {
        Self {
            max_read_registers: 50,
            max_write_registers: 50,
            max_read_coils: 500,
            max_write_coils: 500,
        }
    }

    /// Set maximum read registers.
    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count.min(DEFAULT_MAX_READ_REGISTERS);
        self
    }

    /// Set maximum write registers.
    pub fn with_max_write_registers(mut self, count: u16) -> Self {
        self.max_write_registers = count.min(DEFAULT_MAX_WRITE_REGISTERS);
        self
    }

    /// Set maximum read coils.
    pub fn with_max_read_coils(mut self, count: u16) -> Self {
        self.max_read_coils = count.min(DEFAULT_MAX_READ_COILS);
        self
    }

    /// Set maximum write coils.
    pub fn with_max_write_coils(mut self, count: u16) -> Self {
        self.max_write_coils = count.min(DEFAULT_MAX_WRITE_COILS);
        self
    }

    /// Clamp every limit to the protocol maximum (used after deserialising a profile).
    pub fn clamped(self) -> Self {
        Self::new()
            .with_max_read_registers(self.max_read_registers)
            .with_max_write_registers(self.max_write_registers)
            .with_max_read_coils(self.max_read_coils)
            .with_max_write_coils(self.max_write_coils)
    }

    /// Validate the quantity of a register read.
    pub fn check_register_read(&self, count: u16) -> Result<(), AddressError> {
        check_quantity(count, self.max_read_registers.min(DEFAULT_MAX_READ_REGISTERS))
    }

    /// Validate the quantity of a register write.
    pub fn check_register_write(&self, count: u16) -> Result<(), AddressError> {
        check_quantity(count, self.max_write_registers.min(DEFAULT_MAX_WRITE_REGISTERS))
    }

    /// Validate the quantity of a coil/discrete input read.
    pub fn check_coil_read(&self, count: u16) -> Result<(), AddressError> {
        check_quantity(count, self.max_read_coils.min(DEFAULT_MAX_READ_COILS))
    }

    /// Validate the quantity of a coil write.
    pub fn check_coil_write(&self, count: u16) -> Result<(), AddressError> {
        check_quantity(count, self.max_write_coils.min(DEFAULT_MAX_WRITE_COILS))
    }
}

#[inline]
fn check_quantity(count: u16, max: u16) -> Result<(), AddressError> {
    if count == 0 {
        return Err(AddressError::IllegalValue {
            reason: "quantity must be at least 1",
        });
    }
    if count > max {
        return Err(AddressError::IllegalValue {
            reason: "quantity exceeds per-request maximum",
        });
    }
    Ok(())
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_read_registers: DEFAULT_MAX_READ_REGISTERS,
            max_write_registers: DEFAULT_MAX_WRITE_REGISTERS,
            max_read_coils: DEFAULT_MAX_READ_COILS,
            max_write_coils: DEFAULT_MAX_WRITE_COILS,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
