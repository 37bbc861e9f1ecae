//! Modbus protocol definitions and data structures
//!
//! This module contains the core protocol vocabulary shared by the frame codec,
//! the register store and the dispatcher: function codes, exception codes,
//! register spaces and the decoded request / encoded response structures.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::pdu::ModbusPdu;

/// Modbus slave/unit identifier (1-247)
pub type SlaveId = u8;

/// Modbus function codes understood by the slave bank.
///
/// Unsupported codes decode as [`FunctionCode::Other`]; rejecting them is the
/// dispatcher's job, not the codec's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters,
    /// Read Input Registers (0x04)
    ReadInputRegisters,
    /// Write Single Coil (0x05)
    WriteSingleCoil,
    /// Write Single Register (0x06)
    WriteSingleRegister,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters,
    /// Read File Record (0x14)
    ReadFileRecord,
    /// Any other function code
    Other(u8),
}

impl FunctionCode {
    /// Convert from the wire byte
    pub fn from_u8(value: u8) -> Self {
        match value {
            FC_READ_COILS => Self::ReadCoils,
            FC_READ_DISCRETE_INPUTS => Self::ReadDiscreteInputs,
            FC_READ_HOLDING_REGISTERS => Self::ReadHoldingRegisters,
            FC_READ_INPUT_REGISTERS => Self::ReadInputRegisters,
            FC_WRITE_SINGLE_COIL => Self::WriteSingleCoil,
            FC_WRITE_SINGLE_REGISTER => Self::WriteSingleRegister,
            FC_WRITE_MULTIPLE_COILS => Self::WriteMultipleCoils,
            FC_WRITE_MULTIPLE_REGISTERS => Self::WriteMultipleRegisters,
            FC_READ_FILE_RECORD => Self::ReadFileRecord,
            other => Self::Other(other),
        }
    }

    /// Convert to the wire byte
    pub fn to_u8(self) -> u8 {
        match self {
            Self::ReadCoils => FC_READ_COILS,
            Self::ReadDiscreteInputs => FC_READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters => FC_READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters => FC_READ_INPUT_REGISTERS,
            Self::WriteSingleCoil => FC_WRITE_SINGLE_COIL,
            Self::WriteSingleRegister => FC_WRITE_SINGLE_REGISTER,
            Self::WriteMultipleCoils => FC_WRITE_MULTIPLE_COILS,
            Self::WriteMultipleRegisters => FC_WRITE_MULTIPLE_REGISTERS,
            Self::ReadFileRecord => FC_READ_FILE_RECORD,
            Self::Other(code) => code,
        }
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            Self::WriteSingleCoil
                | Self::WriteSingleRegister
                | Self::WriteMultipleCoils
                | Self::WriteMultipleRegisters
        )
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (0x{:02X})",
            ModbusPdu::function_code_description(self.to_u8()),
            self.to_u8()
        )
    }
}

/// Modbus exception codes produced by the slave bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = EXCEPTION_ILLEGAL_FUNCTION,
    IllegalDataAddress = EXCEPTION_ILLEGAL_DATA_ADDRESS,
    IllegalDataValue = EXCEPTION_ILLEGAL_DATA_VALUE,
    SlaveDeviceFailure = EXCEPTION_SLAVE_DEVICE_FAILURE,
}

impl ExceptionCode {
    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal Function",
            Self::IllegalDataAddress => "Illegal Data Address",
            Self::IllegalDataValue => "Illegal Data Value",
            Self::SlaveDeviceFailure => "Slave Device Failure",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.to_u8(), self.description())
    }
}

/// The four independently-addressed register spaces of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterSpace {
    /// Read/write bits
    Coils,
    /// Read-only bits (from the master's perspective)
    DiscreteInputs,
    /// Read/write 16-bit words
    HoldingRegisters,
    /// Read-only 16-bit words
    InputRegisters,
}

impl RegisterSpace {
    /// Bit spaces hold `bool`, word spaces hold `u16`
    pub fn is_bit_space(self) -> bool {
        matches!(self, Self::Coils | Self::DiscreteInputs)
    }
}

impl fmt::Display for RegisterSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Coils => "coils",
            Self::DiscreteInputs => "discrete inputs",
            Self::HoldingRegisters => "holding registers",
            Self::InputRegisters => "input registers",
        };
        f.write_str(name)
    }
}

/// A single register value as seen by collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Bit(bool),
    Word(u16),
}

impl From<bool> for RegisterValue {
    fn from(value: bool) -> Self {
        Self::Bit(value)
    }
}

impl From<u16> for RegisterValue {
    fn from(value: u16) -> Self {
        Self::Word(value)
    }
}

/// A decoded, CRC-validated RTU request.
///
/// The payload is everything between the function code and the CRC; its
/// semantic validity is checked by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub slave_id: SlaveId,
    pub function: FunctionCode,
    pub payload: Vec<u8>,
    /// Length of the whole frame on the wire, CRC included
    pub frame_len: usize,
}

impl Request {
    /// Read a big-endian u16 at `offset` within the payload
    #[inline]
    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        self.payload
            .get(offset..offset + 2)
            .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a byte at `offset` within the payload
    #[inline]
    pub fn u8_at(&self, offset: usize) -> Option<u8> {
        self.payload.get(offset).copied()
    }
}

/// A response ready to be framed: the slave address plus a complete PDU
/// (function code first, exception flag set for exception responses).
#[derive(Debug, Clone)]
pub struct Response {
    pub slave_id: SlaveId,
    pub pdu: ModbusPdu,
}

impl Response {
    /// Create a success response from a built PDU
    pub fn success(slave_id: SlaveId, pdu: ModbusPdu) -> Self {
        Self { slave_id, pdu }
    }

    /// Create an exception response for `function`
    pub fn exception(slave_id: SlaveId, function: u8, code: ExceptionCode) -> Self {
        Self {
            slave_id,
            pdu: ModbusPdu::exception(function, code.to_u8()),
        }
    }

    /// Function code byte as it appears on the wire
    pub fn function_code(&self) -> u8 {
        self.pdu.function_code().unwrap_or(0)
    }

    /// Check if exception response
    pub fn is_exception(&self) -> bool {
        self.pdu.is_exception()
    }

    /// Exception code, if this is an exception response
    pub fn exception_code(&self) -> Option<u8> {
        self.pdu.exception_code()
    }

    /// Data bytes following the function code
    pub fn data(&self) -> &[u8] {
        self.pdu.as_slice().get(1..).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_code_round_trip() {
        for code in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10, 0x14, 0x2B] {
            assert_eq!(FunctionCode::from_u8(code).to_u8(), code);
        }
        assert_eq!(FunctionCode::from_u8(0x2B), FunctionCode::Other(0x2B));
        assert!(FunctionCode::WriteMultipleCoils.is_write_function());
        assert!(!FunctionCode::ReadFileRecord.is_write_function());
    }

    #[test]
    fn test_request_field_access() {
        let request = Request {
            slave_id: 1,
            function: FunctionCode::ReadHoldingRegisters,
            payload: vec![0x00, 0x6B, 0x00, 0x03],
            frame_len: 8,
        };
        assert_eq!(request.u16_at(0), Some(0x006B));
        assert_eq!(request.u16_at(2), Some(3));
        assert_eq!(request.u16_at(3), None);
        assert_eq!(request.u8_at(4), None);
    }

    #[test]
    fn test_exception_response() {
        let response = Response::exception(7, 0x03, ExceptionCode::IllegalDataAddress);
        assert!(response.is_exception());
        assert_eq!(response.function_code(), 0x83);
        assert_eq!(response.exception_code(), Some(0x02));
    }

    #[test]
    fn test_register_value_json() {
        let bit: RegisterValue = serde_json::from_str("true").unwrap();
        let word: RegisterValue = serde_json::from_str("1234").unwrap();
        assert_eq!(bit, RegisterValue::Bit(true));
        assert_eq!(word, RegisterValue::Word(1234));
    }
}
