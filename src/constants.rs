//! Modbus protocol constants based on official specification
//!
//! These constants are derived from the official Modbus specification:
//! - Maximum RTU ADU size: 256 bytes (slave address + PDU + CRC)
//! - Register/coil limits are calculated to fit within the PDU size constraint

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum RTU ADU size (slave address + PDU + CRC)
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Smallest well-formed RTU frame: slave address(1) + function code(1) + CRC(2)
pub const MIN_RTU_FRAME_SIZE: usize = 4;

/// Length of the trailing CRC field
pub const CRC_LEN: usize = 2;

/// Lowest assignable slave address
pub const MIN_SLAVE_ID: u8 = 1;

/// Highest assignable slave address (248-255 are reserved)
pub const MAX_SLAVE_ID: u8 = 247;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04 (Read Holding/Input Registers)
///
/// Response PDU: Function Code(1) + Byte Count(1) + N × 2 ≤ 253 → N ≤ 125
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Request PDU: FC(1) + Address(2) + Quantity(2) + Byte Count(1) + N × 2 ≤ 253 → N ≤ 123
pub const MAX_WRITE_REGISTERS: usize = 123;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum number of coils for FC01/FC02 (Read Coils/Discrete Inputs)
///
/// Response PDU: FC(1) + Byte Count(1) + ceil(N / 8) ≤ 253 → N ≤ 2008, spec defines 2000
pub const MAX_READ_COILS: usize = 2000;

/// Maximum number of coils for FC15 (Write Multiple Coils)
///
/// Request PDU: FC(1) + Address(2) + Quantity(2) + Byte Count(1) + ceil(N / 8) ≤ 253,
/// spec defines N ≤ 1968 (0x7B0)
pub const MAX_WRITE_COILS: usize = 1968;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Read File Record (FC20)
pub const FC_READ_FILE_RECORD: u8 = 0x14;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Function-specific wire values
// ============================================================================

/// Coil ON value for FC05
pub const COIL_ON: u16 = 0xFF00;

/// Coil OFF value for FC05
pub const COIL_OFF: u16 = 0x0000;

/// The only reference type defined for file record access
pub const FILE_RECORD_REFERENCE_TYPE: u8 = 6;

/// Byte count of a single FC20 sub-request (ref type + file + record + length)
pub const FILE_SUB_REQUEST_LEN: u8 = 7;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Slave Device Failure
pub const EXCEPTION_SLAVE_DEVICE_FAILURE: u8 = 0x04;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(MAX_RTU_FRAME_SIZE, 1 + MAX_PDU_SIZE + CRC_LEN);
        assert_eq!(MIN_RTU_FRAME_SIZE, 1 + 1 + CRC_LEN);
    }

    #[test]
    fn test_register_limits() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);

        let write_pdu_size = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS * 2);
        assert!(write_pdu_size <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_coil_limits() {
        let read_coil_pdu = 1 + 1 + MAX_READ_COILS.div_ceil(8);
        assert!(read_coil_pdu <= MAX_PDU_SIZE);

        let write_coil_pdu = 1 + 2 + 2 + 1 + MAX_WRITE_COILS.div_ceil(8);
        assert!(write_coil_pdu <= MAX_PDU_SIZE);
    }
}
