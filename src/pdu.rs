//! Optimized Modbus PDU data structure
//!
//! Use a fixed-size stack array to avoid heap allocation while building responses.

use tracing::debug;

use crate::constants::{EXCEPTION_FLAG, MAX_PDU_SIZE};
use crate::error::AddressError;

/// Overflow of the PDU buffer: the response would not fit a single RTU frame.
const PDU_OVERFLOW: AddressError = AddressError::IllegalValue {
    reason: "response exceeds maximum PDU size",
};

/// High-performance PDU with stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    /// Fixed-size buffer (stack)
    data: [u8; MAX_PDU_SIZE],
    /// Actual data length
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create an exception PDU: `function | 0x80` followed by the exception code
    #[inline]
    pub fn exception(function: u8, code: u8) -> Self {
        let mut pdu = Self::new();
        pdu.data[0] = function | EXCEPTION_FLAG;
        pdu.data[1] = code;
        pdu.len = 2;
        pdu
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<(), AddressError> {
        if self.len >= MAX_PDU_SIZE {
            return Err(PDU_OVERFLOW);
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<(), AddressError> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)?;
        Ok(())
    }

    /// Extend with a byte slice
    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> Result<(), AddressError> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(PDU_OVERFLOW);
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// Get immutable data slice
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Get current length
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        if self.len > 0 {
            Some(self.data[0])
        } else {
            None
        }
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    /// Get exception code
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() && self.len > 1 {
            Some(self.data[1])
        } else {
            None
        }
    }

    /// Get human-readable function code description
    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & !EXCEPTION_FLAG {
            0x01 => "Read Coils",
            0x02 => "Read Discrete Inputs",
            0x03 => "Read Holding Registers",
            0x04 => "Read Input Registers",
            0x05 => "Write Single Coil",
            0x06 => "Write Single Register",
            0x0F => "Write Multiple Coils",
            0x10 => "Write Multiple Registers",
            0x14 => "Read File Record",
            _ => "Unknown Function",
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    /// Create a new builder
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    /// Set function code
    #[inline]
    pub fn function_code(mut self, fc: u8) -> Result<Self, AddressError> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    /// Add address
    #[inline]
    pub fn address(mut self, addr: u16) -> Result<Self, AddressError> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    /// Add quantity (or the echoed value of a single write)
    #[inline]
    pub fn quantity(mut self, qty: u16) -> Result<Self, AddressError> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    /// Add a byte
    #[inline]
    pub fn byte(mut self, b: u8) -> Result<Self, AddressError> {
        self.pdu.push(b)?;
        Ok(self)
    }

    /// Add data
    #[inline]
    pub fn data(mut self, data: &[u8]) -> Result<Self, AddressError> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    /// Add big-endian words
    #[inline]
    pub fn words(mut self, words: &[u16]) -> Result<Self, AddressError> {
        for &word in words {
            self.pdu.push_u16(word)?;
        }
        Ok(self)
    }

    /// Build the PDU
    #[inline]
    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            debug!(
                "PDU built: FC={:02X} ({}), total_len={}",
                fc,
                ModbusPdu::function_code_description(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }

    /// Build a bit read response (FC01/FC02): byte count + LSB-first packed bits
    pub fn build_bit_response(fc: u8, bits: &[bool]) -> Result<ModbusPdu, AddressError> {
        let packed = pack_bits(bits);
        Ok(PduBuilder::new()
            .function_code(fc)?
            .byte(packed.len() as u8)?
            .data(&packed)?
            .build())
    }

    /// Build a register read response (FC03/FC04): byte count + big-endian words
    pub fn build_register_response(fc: u8, words: &[u16]) -> Result<ModbusPdu, AddressError> {
        Ok(PduBuilder::new()
            .function_code(fc)?
            .byte((words.len() * 2) as u8)?
            .words(words)?
            .build())
    }

    /// Build a write echo response (FC05/06/0F/10): address + value or quantity
    pub fn build_write_echo(fc: u8, address: u16, value: u16) -> Result<ModbusPdu, AddressError> {
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(address)?
            .quantity(value)?
            .build())
    }
}

/// Pack bits into bytes, LSB first within each byte
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `count` bits from LSB-first packed bytes
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).is_some_and(|byte| byte & (1 << (i % 8)) != 0))
        .collect()
}
