//! End-to-end tests: a master talks to a running `SlaveBankServer` over an in-memory
//! serial line.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

use rtu_slave_bank::config::SerialConfig;
use rtu_slave_bank::{
    crc16, Endpoint, ExceptionCode, LoopState, ModbusError, ModbusResult, RegisterSpace,
    ResourceProbe, ResourceSample, SerialConnector, SerialLink, ServerConfig, SlaveBankServer,
    SlaveConfig,
};

const PRIMARY: &str = "/dev/ttyUSB0";
const SECONDARY: &str = "/dev/ttyUSB1";

/// Hands out one prepared duplex end per port name, failing for unknown ports
#[derive(Default)]
struct PortMap {
    links: Mutex<HashMap<String, DuplexStream>>,
}

impl PortMap {
    fn with(port: &str, link: DuplexStream) -> Self {
        let map = Self::default();
        map.links.lock().unwrap().insert(port.to_string(), link);
        map
    }
}

impl SerialConnector for PortMap {
    fn open(&self, port: &str, _serial: &SerialConfig) -> ModbusResult<Box<dyn SerialLink>> {
        match self.links.lock().unwrap().remove(port) {
            Some(link) => Ok(Box::new(link)),
            None => Err(ModbusError::connection(format!("{} not present", port))),
        }
    }
}

/// Fails the first `failures` opens, then hands out fresh links and keeps the
/// master ends open
struct FlakyConnector {
    failures: Mutex<u32>,
    opens: Mutex<u32>,
    masters: Mutex<Vec<DuplexStream>>,
}

impl FlakyConnector {
    fn new(failures: u32) -> Self {
        Self {
            failures: Mutex::new(failures),
            opens: Mutex::new(0),
            masters: Mutex::new(Vec::new()),
        }
    }

    fn opens(&self) -> u32 {
        *self.opens.lock().unwrap()
    }
}

impl SerialConnector for FlakyConnector {
    fn open(&self, port: &str, _serial: &SerialConfig) -> ModbusResult<Box<dyn SerialLink>> {
        *self.opens.lock().unwrap() += 1;
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(ModbusError::connection(format!("{} busy", port)));
        }
        let (master, line) = duplex(1024);
        self.masters.lock().unwrap().push(master);
        Ok(Box::new(line))
    }
}

/// Cool, idle host
struct QuietProbe;

impl ResourceProbe for QuietProbe {
    fn sample(&mut self) -> ResourceSample {
        ResourceSample {
            cpu_percent: 5.0,
            memory_used_mb: 64,
            swap_percent: 0.0,
            temperature_c: Some(40.0),
        }
    }
}

fn config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.serial.port = PRIMARY.to_string();
    config.serial.timeout = 0.05;
    config.serial.inter_frame_timeout_ms = Some(5);
    config.server.reconnect_delay_ms = 10;
    config.server.max_reconnect_delay_ms = 20;
    config.industrial_features.failover_threshold = 1;

    let mut meter = SlaveConfig::new(1, "meter");
    meter.holding_registers.insert(0, 100);
    meter.holding_registers.insert(1, 200);
    config.slaves.push(meter);
    config.slaves.push(SlaveConfig::example(2));
    config
}

fn with_crc(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.extend_from_slice(&crc16(body).to_le_bytes());
    frame
}

async fn start(config: ServerConfig, connector: PortMap) -> SlaveBankServer {
    let mut server = assert_ok!(SlaveBankServer::new(config))
        .with_connector(Arc::new(connector))
        .with_probe(Box::new(QuietProbe));
    assert_ok!(server.start_server().await);
    server
}

async fn wait_listening(server: &SlaveBankServer) {
    timeout(Duration::from_secs(2), async {
        while server.loop_state() != LoopState::Listening {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("transport loop never started listening");
}

async fn exchange(master: &mut DuplexStream, request: &[u8], response_len: usize) -> Vec<u8> {
    master.write_all(request).await.unwrap();
    let mut response = vec![0u8; response_len];
    timeout(Duration::from_secs(1), master.read_exact(&mut response))
        .await
        .expect("no response")
        .unwrap();
    response
}

#[tokio::test]
async fn test_read_holding_registers_over_the_wire() {
    let (mut master, line) = duplex(1024);
    let mut server = start(config(), PortMap::with(PRIMARY, line)).await;
    wait_listening(&server).await;

    let response = exchange(
        &mut master,
        &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B],
        9,
    )
    .await;
    assert_eq!(response, with_crc(&[0x01, 0x03, 0x04, 0x00, 0x64, 0x00, 0xC8]));

    let stats = server.get_statistics(1).unwrap();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.bytes_in, 8);
    assert_eq!(stats.bytes_out, 9);

    server.stop_server().await.unwrap();
    assert!(!server.is_running());
}

#[tokio::test]
async fn test_file_record_read_and_short_record() {
    let (mut master, line) = duplex(1024);
    let mut server = start(config(), PortMap::with(PRIMARY, line)).await;
    wait_listening(&server).await;

    // File 1 record 1 holds 28 bytes: 14 words fit exactly
    let request = with_crc(&[0x02, 0x14, 0x07, 0x06, 0x00, 0x01, 0x00, 0x01, 0x00, 0x0E]);
    let response = exchange(&mut master, &request, 35).await;
    assert_eq!(&response[..5], &[0x02, 0x14, 30, 29, 0x06]);
    assert_eq!(&response[5..20], b"SERIAL_12345678");
    assert!(response[20..33].iter().all(|b| *b == 0));

    // Record 0 holds 30 bytes, 16 words asked
    let request = with_crc(&[0x02, 0x14, 0x07, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10]);
    let response = exchange(&mut master, &request, 5).await;
    assert_eq!(response, with_crc(&[0x02, 0x94, 0x02]));

    server.stop_server().await.unwrap();
}

#[tokio::test]
async fn test_statistics_count_successes_and_exceptions() {
    let (mut master, line) = duplex(1024);
    let mut server = start(config(), PortMap::with(PRIMARY, line)).await;
    wait_listening(&server).await;

    let good = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B];
    for _ in 0..10 {
        exchange(&mut master, &good, 9).await;
    }
    let missing = with_crc(&[0x01, 0x03, 0x00, 0x10, 0x00, 0x01]);
    for _ in 0..3 {
        let response = exchange(&mut master, &missing, 5).await;
        assert_eq!(response, with_crc(&[0x01, 0x83, 0x02]));
    }

    let stats = server.get_statistics(1).unwrap();
    assert_eq!(stats.total_requests, 13);
    assert_eq!(stats.successful_requests, 10);
    assert_eq!(stats.error_requests.get(ExceptionCode::IllegalDataAddress), 3);
    assert_eq!(stats.error_requests.total(), 3);
    assert!(stats.last_request_timestamp.is_some());

    server.stop_server().await.unwrap();
}

#[tokio::test]
async fn test_unknown_slave_and_corrupt_frame_stay_silent() {
    let (mut master, line) = duplex(1024);
    let mut server = start(config(), PortMap::with(PRIMARY, line)).await;
    wait_listening(&server).await;

    let unknown = with_crc(&[0x09, 0x03, 0x00, 0x00, 0x00, 0x01]);
    master.write_all(&unknown).await.unwrap();
    let mut corrupt = with_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
    corrupt[7] ^= 0xFF;
    tokio::time::sleep(Duration::from_millis(30)).await;
    master.write_all(&corrupt).await.unwrap();

    let mut byte = [0u8; 1];
    let silent = timeout(Duration::from_millis(200), master.read(&mut byte)).await;
    assert!(silent.is_err(), "unexpected reply byte {:02X}", byte[0]);

    // The line is still served afterwards
    let response = exchange(
        &mut master,
        &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B],
        9,
    )
    .await;
    assert_eq!(response[1], 0x03);
    assert_eq!(server.get_statistics(1).unwrap().total_requests, 1);

    server.stop_server().await.unwrap();
}

#[tokio::test]
async fn test_quantity_over_limit_is_illegal_value() {
    let (mut master, line) = duplex(1024);
    let mut server = start(config(), PortMap::with(PRIMARY, line)).await;
    wait_listening(&server).await;

    // 126 holding registers
    let request = with_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x7E]);
    let response = exchange(&mut master, &request, 5).await;
    assert_eq!(response, with_crc(&[0x01, 0x83, 0x03]));

    // Unsupported function
    let request = with_crc(&[0x01, 0x07]);
    let response = exchange(&mut master, &request, 5).await;
    assert_eq!(response, with_crc(&[0x01, 0x87, 0x01]));

    server.stop_server().await.unwrap();
}

#[tokio::test]
async fn test_collaborator_updates_are_visible_to_master() {
    let (mut master, line) = duplex(1024);
    let mut server = start(config(), PortMap::with(PRIMARY, line)).await;
    wait_listening(&server).await;

    server
        .update_register(1, RegisterSpace::HoldingRegisters, 1, 0x1234u16.into())
        .unwrap();
    let response = exchange(
        &mut master,
        &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B],
        9,
    )
    .await;
    assert_eq!(&response[3..7], &[0x00, 0x64, 0x12, 0x34]);

    // A master write is seen by collaborators
    let write = with_crc(&[0x01, 0x06, 0x00, 0x00, 0xBE, 0xEF]);
    let echo = exchange(&mut master, &write, 8).await;
    assert_eq!(echo, write);
    let view = server.get_slave_data(1).unwrap();
    assert_eq!(view.config.holding_registers.get(&0), Some(&0xBEEF));

    // Removed slaves go silent
    server.remove_slave(1).unwrap();
    master
        .write_all(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B])
        .await
        .unwrap();
    let mut byte = [0u8; 1];
    assert!(timeout(Duration::from_millis(200), master.read(&mut byte))
        .await
        .is_err());

    server.stop_server().await.unwrap();
}

#[tokio::test]
async fn test_failover_to_redundant_port_resets_failures() {
    let mut config = config();
    config.industrial_features.enable_redundancy = true;
    config.industrial_features.redundant_port = Some(SECONDARY.to_string());

    let (mut master, line) = duplex(1024);
    let mut server = start(config, PortMap::with(SECONDARY, line)).await;
    wait_listening(&server).await;

    let state = server.transport_state();
    assert_eq!(state.active, Endpoint::Secondary);
    assert_eq!(state.consecutive_failure_count, 0);
    assert!(state.last_switch_timestamp.is_some());

    let response = exchange(
        &mut master,
        &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B],
        9,
    )
    .await;
    assert_eq!(response[1], 0x03);

    server.stop_server().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_port_is_fatal() {
    let mut server = start(config(), PortMap::default()).await;

    let result = assert_ok!(timeout(Duration::from_secs(5), server.wait()).await);
    assert!(matches!(result, Err(ModbusError::Connection { .. })));
    assert!(!server.is_running());

    server.stop_server().await.unwrap();
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let (_master, line) = duplex(1024);
    let mut server = start(config(), PortMap::with(PRIMARY, line)).await;

    assert_err!(server.start_server().await);
    assert!(server.uptime().is_some());

    assert_ok!(server.stop_server().await);
    assert!(server.uptime().is_none());
}

#[tokio::test]
async fn test_restart_after_fatal_starts_with_clean_failover_state() {
    let mut config = config();
    config.industrial_features.failover_threshold = 2;
    let connector = Arc::new(FlakyConnector::new(4));

    let mut server = assert_ok!(SlaveBankServer::new(config))
        .with_connector(Arc::clone(&connector) as Arc<dyn SerialConnector>)
        .with_probe(Box::new(QuietProbe));

    // Three failed opens exceed the threshold of two
    assert_ok!(server.start_server().await);
    let result = assert_ok!(timeout(Duration::from_secs(5), server.wait()).await);
    assert_err!(result);
    assert_eq!(connector.opens(), 3);
    assert_ok!(server.stop_server().await);

    // One more failure is retried instead of being fatal again
    assert_ok!(server.start_server().await);
    wait_listening(&server).await;
    assert_eq!(connector.opens(), 5);
    assert!(server.is_running());
    assert_eq!(server.transport_state().consecutive_failure_count, 1);

    assert_ok!(server.stop_server().await);
}
