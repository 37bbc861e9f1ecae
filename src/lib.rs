//! # RTU Slave Bank - Multi-Device Modbus RTU Responder
//!
//! **Version:** 0.1.0
//! **License:** MIT
//!
//! Emulates any number of Modbus RTU slave devices on one serial line. Each virtual
//! slave exposes coils, discrete inputs, holding and input registers and file records,
//! and answers master polls exactly like a field device would. Used to stand in for
//! real equipment in integration tests, simulation rigs and monitoring harnesses on
//! small single-board hosts.
//!
//! ## Features
//!
//! - **RTU framing**: inter-frame silence detection, CRC-16/MODBUS validation
//! - **Typed register spaces**: one reader/writer lock per slave, atomic range access
//! - **Protocol-correct exceptions**: silent drop for unknown slaves and corrupt frames
//! - **Supervision**: watchdog, temperature throttling, failover to a redundant port
//! - **Snapshots**: periodic point-in-time JSON copies of every slave
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Slave |
//! |------|----------|-------|
//! | 0x01 | Read Coils | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ |
//! | 0x03 | Read Holding Registers | ✅ |
//! | 0x04 | Read Input Registers | ✅ |
//! | 0x05 | Write Single Coil | ✅ |
//! | 0x06 | Write Single Register | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ |
//! | 0x14 | Read File Record | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rtu_slave_bank::{ModbusResult, ServerConfig, SlaveBankServer, SlaveConfig};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut config = ServerConfig::default();
//!     config.serial.port = "/dev/ttyUSB0".to_string();
//!     config.slaves.push(SlaveConfig::example(1));
//!
//!     let mut server = SlaveBankServer::new(config)?;
//!     server.start_server().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop_server().await
//! }
//! ```
//!
//! Frames can also be processed without a serial port:
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Instant;
//! use rtu_slave_bank::{FunctionDispatcher, SlaveConfig, SlaveRegistry};
//!
//! let registry = Arc::new(SlaveRegistry::default());
//! let mut slave = SlaveConfig::new(1, "meter");
//! slave.holding_registers.insert(0, 100);
//! slave.holding_registers.insert(1, 200);
//! registry.add_slave(slave).unwrap();
//!
//! let dispatcher = FunctionDispatcher::new(registry);
//! let reply = dispatcher
//!     .process_frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B], Instant::now())
//!     .unwrap();
//! assert_eq!(&reply[..7], &[0x01, 0x03, 0x04, 0x00, 0x64, 0x00, 0xC8]);
//! ```

// ============================================================================
// Protocol core
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on official specification
pub mod constants;

/// Modbus protocol definitions and message types
pub mod protocol;

/// High-performance PDU with stack-allocated fixed array
pub mod pdu;

/// RTU frame encoding/decoding and CRC-16
pub mod frame;

/// Per-slave quantity limits
pub mod device_limits;

// ============================================================================
// Slave state
// ============================================================================

/// Register spaces and file records of one slave
pub mod store;

/// Per-slave request counters
pub mod stats;

/// Set of configured slaves and collaborator operations
pub mod registry;

/// Function code handlers
pub mod dispatcher;

// ============================================================================
// Runtime
// ============================================================================

/// Server configuration file model
pub mod config;

/// Serial event loop
pub mod transport;

/// Resource monitor and watchdog
pub mod health;

/// Primary/secondary endpoint failover
pub mod redundancy;

/// Periodic state snapshots
pub mod snapshot;

/// Server façade and background tasks
pub mod server;

/// Packet logging and subscriber setup
pub mod logging;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime ===
pub use tokio;

// === Error handling ===
pub use error::{
    AddressError, FileError, FrameError, ModbusError, ModbusResult, RegistryError, UpdateError,
};

// === Core types ===
pub use protocol::{
    ExceptionCode, FunctionCode, RegisterSpace, RegisterValue, Request, Response, SlaveId,
};
pub use frame::{crc16, decode_request, encode_response};
pub use pdu::{ModbusPdu, PduBuilder};
pub use device_limits::DeviceLimits;

// === Slave state ===
pub use store::{RegisterStore, SlaveConfig};
pub use stats::{ErrorCounts, Statistics};
pub use registry::{SlaveRegistry, SnapshotView};
pub use dispatcher::FunctionDispatcher;

// === Runtime ===
pub use config::{Parity, ServerConfig};
pub use transport::{LoopState, SerialConnector, SerialLink, TokioSerialConnector, TransportLoop};
pub use health::{HealthState, HealthSupervisor, ResourceProbe, ResourceSample, SystemProbe};
pub use redundancy::{Endpoint, FailoverDecision, RedundancyManager, TransportState};
pub use snapshot::{DirectorySink, RegistrySnapshot, SnapshotScheduler, SnapshotSink};
pub use server::SlaveBankServer;

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_RTU_FRAME_SIZE, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("RTU Slave Bank v{} - Multi-device Modbus RTU responder", VERSION)
}
