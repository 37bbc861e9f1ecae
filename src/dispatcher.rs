//! # Function Dispatcher
//!
//! Executes decoded requests against the addressed slave and produces either a
//! success response or a Modbus exception.
//!
//! ## Request lifecycle
//!
//! 1. Resolve the slave id. Frames for unknown slaves (broadcast included) get no
//!    response at all.
//! 2. Count the request and stamp `last_request_timestamp`.
//! 3. Run the handler for the function code; unsupported codes yield `IllegalFunction`.
//! 4. Count the outcome, by exception kind for failures.
//!
//! A request whose response cannot be produced within `response_timeout` of its
//! arrival is answered with `SlaveDeviceFailure` instead of staying silent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::constants::*;
use crate::frame::{decode_request, encode_response};
use crate::pdu::{unpack_bits, ModbusPdu, PduBuilder};
use crate::protocol::{ExceptionCode, FunctionCode, RegisterSpace, Request, Response};
use crate::registry::SlaveRegistry;
use crate::store::RegisterStore;

/// Largest record length (in words) whose 0x14 response still fits one PDU:
/// function(1) + resp_len(1) + file_resp_len(1) + ref_type(1) + 2 * words
const MAX_FILE_RECORD_WORDS: u16 = ((MAX_PDU_SIZE - 4) / 2) as u16;

type HandlerResult = Result<ModbusPdu, ExceptionCode>;

/// Default response budget
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Routes requests to the register stores of a [`SlaveRegistry`]
#[derive(Debug, Clone)]
pub struct FunctionDispatcher {
    registry: Arc<SlaveRegistry>,
    response_timeout: Duration,
}

impl FunctionDispatcher {
    pub fn new(registry: Arc<SlaveRegistry>) -> Self {
        Self::with_response_timeout(registry, DEFAULT_RESPONSE_TIMEOUT)
    }

    pub fn with_response_timeout(registry: Arc<SlaveRegistry>, response_timeout: Duration) -> Self {
        Self {
            registry,
            response_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SlaveRegistry> {
        &self.registry
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Decode a raw frame, dispatch it and encode the reply.
    ///
    /// Returns `None` when nothing must be written back: malformed frames and
    /// frames addressed to slaves that are not configured.
    pub fn process_frame(&self, frame: &[u8], received_at: Instant) -> Option<Vec<u8>> {
        let request = match decode_request(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping malformed frame ({} bytes): {}", frame.len(), e);
                return None;
            }
        };

        let response = self.dispatch(&request, received_at)?;
        let bytes = encode_response(&response);
        if let Some(entry) = self.registry.get(request.slave_id) {
            entry.stats().record_traffic(frame.len(), bytes.len());
        }
        Some(bytes)
    }

    /// Execute a decoded request.
    ///
    /// Returns `None` if the addressed slave is not configured.
    pub fn dispatch(&self, request: &Request, received_at: Instant) -> Option<Response> {
        let Some(entry) = self.registry.get(request.slave_id) else {
            debug!(
                "No slave {} configured, ignoring {}",
                request.slave_id, request.function
            );
            return None;
        };
        entry.stats().record_request(Utc::now());

        let result = if self.budget_exceeded(received_at) {
            Err(ExceptionCode::SlaveDeviceFailure)
        } else {
            execute(entry.store(), request).and_then(|pdu| {
                if self.budget_exceeded(received_at) {
                    Err(ExceptionCode::SlaveDeviceFailure)
                } else {
                    Ok(pdu)
                }
            })
        };

        match result {
            Ok(pdu) => {
                entry.stats().record_success();
                debug!(
                    "Slave {} served {} ({} bytes)",
                    request.slave_id,
                    request.function,
                    pdu.len()
                );
                Some(Response::success(request.slave_id, pdu))
            }
            Err(code) => {
                entry.stats().record_error(code);
                warn!(
                    "Slave {} rejected {}: exception {}",
                    request.slave_id, request.function, code
                );
                Some(Response::exception(
                    request.slave_id,
                    request.function.to_u8(),
                    code,
                ))
            }
        }
    }

    fn budget_exceeded(&self, received_at: Instant) -> bool {
        received_at.elapsed() > self.response_timeout
    }
}

/// Map the function code to its handler
fn execute(store: &RegisterStore, request: &Request) -> HandlerResult {
    match request.function {
        FunctionCode::ReadCoils => read_bits(store, request, RegisterSpace::Coils),
        FunctionCode::ReadDiscreteInputs => read_bits(store, request, RegisterSpace::DiscreteInputs),
        FunctionCode::ReadHoldingRegisters => {
            read_words(store, request, RegisterSpace::HoldingRegisters)
        }
        FunctionCode::ReadInputRegisters => read_words(store, request, RegisterSpace::InputRegisters),
        FunctionCode::WriteSingleCoil => write_single_coil(store, request),
        FunctionCode::WriteSingleRegister => write_single_register(store, request),
        FunctionCode::WriteMultipleCoils => write_multiple_coils(store, request),
        FunctionCode::WriteMultipleRegisters => write_multiple_registers(store, request),
        FunctionCode::ReadFileRecord => read_file_record(store, request),
        FunctionCode::Other(_) => Err(ExceptionCode::IllegalFunction),
    }
}

/// Big-endian `(address, quantity_or_value)` header shared by all fixed-size requests
fn address_and_quantity(request: &Request) -> Result<(u16, u16), ExceptionCode> {
    match (request.u16_at(0), request.u16_at(2)) {
        (Some(address), Some(quantity)) => Ok((address, quantity)),
        _ => Err(ExceptionCode::IllegalDataValue),
    }
}

/// Read Coils (0x01) / Read Discrete Inputs (0x02)
fn read_bits(store: &RegisterStore, request: &Request, space: RegisterSpace) -> HandlerResult {
    let (address, quantity) = address_and_quantity(request)?;
    let bits = store.read_bits(space, address, quantity)?;
    Ok(PduBuilder::build_bit_response(request.function.to_u8(), &bits)?)
}

/// Read Holding Registers (0x03) / Read Input Registers (0x04)
fn read_words(store: &RegisterStore, request: &Request, space: RegisterSpace) -> HandlerResult {
    let (address, quantity) = address_and_quantity(request)?;
    let words = store.read_words(space, address, quantity)?;
    Ok(PduBuilder::build_register_response(request.function.to_u8(), &words)?)
}

/// Write Single Coil (0x05)
fn write_single_coil(store: &RegisterStore, request: &Request) -> HandlerResult {
    let (address, raw) = address_and_quantity(request)?;
    let value = match raw {
        COIL_ON => true,
        COIL_OFF => false,
        _ => return Err(ExceptionCode::IllegalDataValue),
    };
    store.write_bits(RegisterSpace::Coils, address, &[value])?;
    Ok(PduBuilder::build_write_echo(FC_WRITE_SINGLE_COIL, address, raw)?)
}

/// Write Single Register (0x06)
fn write_single_register(store: &RegisterStore, request: &Request) -> HandlerResult {
    let (address, value) = address_and_quantity(request)?;
    store.write_words(RegisterSpace::HoldingRegisters, address, &[value])?;
    Ok(PduBuilder::build_write_echo(FC_WRITE_SINGLE_REGISTER, address, value)?)
}

/// Data section of a 0x0F/0x10 request, checked against the expected byte count
fn write_data(request: &Request, expected_bytes: usize) -> Result<&[u8], ExceptionCode> {
    let byte_count = request.u8_at(4).ok_or(ExceptionCode::IllegalDataValue)? as usize;
    if byte_count != expected_bytes {
        return Err(ExceptionCode::IllegalDataValue);
    }
    request
        .payload
        .get(5..5 + byte_count)
        .ok_or(ExceptionCode::IllegalDataValue)
}

/// Write Multiple Coils (0x0F)
fn write_multiple_coils(store: &RegisterStore, request: &Request) -> HandlerResult {
    let (address, quantity) = address_and_quantity(request)?;
    let data = write_data(request, (quantity as usize).div_ceil(8))?;
    let values = unpack_bits(data, quantity as usize);
    store.write_bits(RegisterSpace::Coils, address, &values)?;
    Ok(PduBuilder::build_write_echo(FC_WRITE_MULTIPLE_COILS, address, quantity)?)
}

/// Write Multiple Registers (0x10)
fn write_multiple_registers(store: &RegisterStore, request: &Request) -> HandlerResult {
    let (address, quantity) = address_and_quantity(request)?;
    let data = write_data(request, quantity as usize * 2)?;
    let values: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    store.write_words(RegisterSpace::HoldingRegisters, address, &values)?;
    Ok(PduBuilder::build_write_echo(FC_WRITE_MULTIPLE_REGISTERS, address, quantity)?)
}

/// Read File Record (0x14), single sub-request
///
/// ```text
/// request:  [byte_count=7][ref_type=6][file:2][record:2][length:2]
/// response: [resp_len][file_resp_len][ref_type][data: 2*length]
/// ```
fn read_file_record(store: &RegisterStore, request: &Request) -> HandlerResult {
    if request.u8_at(0) != Some(FILE_SUB_REQUEST_LEN)
        || request.u8_at(1) != Some(FILE_RECORD_REFERENCE_TYPE)
    {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let (Some(file_number), Some(record_number), Some(record_length)) =
        (request.u16_at(2), request.u16_at(4), request.u16_at(6))
    else {
        return Err(ExceptionCode::IllegalDataValue);
    };
    if record_length == 0 || record_length > MAX_FILE_RECORD_WORDS {
        return Err(ExceptionCode::IllegalDataValue);
    }

    let data = store.read_file_record(file_number, record_number, record_length)?;
    let file_resp_len = data.len() + 1;
    Ok(PduBuilder::new()
        .function_code(FC_READ_FILE_RECORD)?
        .byte((file_resp_len + 1) as u8)?
        .byte(file_resp_len as u8)?
        .byte(FILE_RECORD_REFERENCE_TYPE)?
        .data(&data)?
        .build())
}
