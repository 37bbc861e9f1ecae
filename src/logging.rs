//! Logging helpers: packet hex dumps and subscriber setup.

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::protocol::SlaveId;

/// Direction of a logged packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Recv,
    Send,
}

impl PacketDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketDirection::Recv => "recv",
            PacketDirection::Send => "send",
        }
    }
}

/// Format bytes as space-separated uppercase hex
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `[MODBUS-RTU] recv slave:1 01 03 00 00 00 02 C4 0B`
pub fn format_packet(direction: PacketDirection, data: &[u8]) -> String {
    let slave = data
        .first()
        .map_or_else(|| "-".to_string(), |id: &SlaveId| id.to_string());
    format!(
        "[MODBUS-RTU] {} slave:{} {}",
        direction.as_str(),
        slave,
        format_hex(data)
    )
}

/// Log a raw frame at info level
pub fn log_packet(direction: PacketDirection, data: &[u8]) {
    info!("{}", format_packet(direction, data));
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_level`. Calling this twice is harmless.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level.to_ascii_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
