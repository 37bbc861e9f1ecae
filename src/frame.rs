//! # RTU Frame Codec
//!
//! Stateless encoding and decoding of Modbus RTU frames.
//!
//! ```text
//! [slave_id:1][function_code:1][payload:N][crc16:2 little-endian]
//! ```
//!
//! The CRC is CRC-16/MODBUS (reflected polynomial 0xA001, init 0xFFFF) computed over
//! every byte preceding the CRC field. All multi-byte numeric payload fields are
//! big-endian; only the CRC is little-endian.
//!
//! Decoding validates framing only. A frame that carries a well-formed header and a
//! valid CRC decodes successfully even when its payload is semantically invalid or
//! its function code unsupported; those are protocol errors answered by the dispatcher.

use crc::{Crc, CRC_16_MODBUS};
use tracing::debug;

use crate::constants::*;
use crate::error::FrameError;
use crate::protocol::{FunctionCode, Request, Response};

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Calculate the CRC-16/MODBUS checksum of `data`
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Check the trailing little-endian CRC of a complete frame
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < CRC_LEN + 1 {
        return false;
    }
    let data_len = frame.len() - CRC_LEN;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    crc16(&frame[..data_len]) == received
}

/// Minimum total frame length (CRC included) for the function code in `frame[1]`,
/// given the bytes already available.
///
/// For variable-length requests the declared byte count is taken into account once it
/// is present; before that, the length of the fixed header is returned.
pub fn required_request_len(frame: &[u8]) -> usize {
    let Some(&function) = frame.get(1) else {
        return MIN_RTU_FRAME_SIZE;
    };
    match function {
        FC_READ_COILS..=FC_WRITE_SINGLE_REGISTER => 1 + 1 + 4 + CRC_LEN,
        FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => {
            // address(2) + quantity(2) + byte_count(1) + data(byte_count)
            let byte_count = frame.get(6).copied().unwrap_or(0) as usize;
            1 + 1 + 5 + byte_count + CRC_LEN
        }
        FC_READ_FILE_RECORD => {
            // byte_count(1) + sub-requests(byte_count)
            let byte_count = frame.get(2).copied().unwrap_or(0) as usize;
            1 + 1 + 1 + byte_count + CRC_LEN
        }
        _ => MIN_RTU_FRAME_SIZE,
    }
}

/// Decode and validate a request frame received from the bus.
///
/// # Errors
///
/// - [`FrameError::TooShort`] below the minimum RTU frame size
/// - [`FrameError::TooLong`] above the RTU ADU limit
/// - [`FrameError::Truncated`] when the declared function's header or byte count is incomplete
/// - [`FrameError::CrcMismatch`] when the trailing CRC disagrees with the computed one
pub fn decode_request(frame: &[u8]) -> Result<Request, FrameError> {
    let len = frame.len();
    if len < MIN_RTU_FRAME_SIZE {
        return Err(FrameError::TooShort { len });
    }
    if len > MAX_RTU_FRAME_SIZE {
        return Err(FrameError::TooLong { len });
    }

    let needed = required_request_len(frame);
    if len < needed {
        return Err(FrameError::Truncated {
            function: frame[1],
            needed,
            len,
        });
    }

    let data_len = len - CRC_LEN;
    let actual = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let expected = crc16(&frame[..data_len]);
    if actual != expected {
        return Err(FrameError::CrcMismatch { expected, actual });
    }

    let request = Request {
        slave_id: frame[0],
        function: FunctionCode::from_u8(frame[1]),
        payload: frame[2..data_len].to_vec(),
        frame_len: len,
    };
    debug!(
        "RTU request decoded: slave={}, function={}, payload_len={}",
        request.slave_id,
        request.function,
        request.payload.len()
    );
    Ok(request)
}

/// Serialize a response into an RTU frame with a freshly computed CRC.
pub fn encode_response(response: &Response) -> Vec<u8> {
    let pdu = response.pdu.as_slice();
    let mut frame = Vec::with_capacity(1 + pdu.len() + CRC_LEN);
    frame.push(response.slave_id);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}
