//! # RTU Transport Loop
//!
//! Owns the serial endpoint and runs the read → dispatch → write cycle.
//!
//! ## States
//!
//! ```text
//!  Idle ──bind ok──▶ Listening ──frame──▶ Processing ──reply/drop──▶ Listening
//!                        │
//!          N consecutive I/O failures / watchdog
//!                        ▼
//!                    Degraded ──rebind ok──▶ Listening
//!                        │
//!               no endpoint left ──▶ fatal error
//! ```
//!
//! ## Framing
//!
//! RTU frames carry no length prefix. A frame starts with the first byte after a
//! quiet period and ends when the line stays silent for the inter-frame timeout
//! (3.5 character times). The first byte is awaited for at most `serial.timeout`,
//! after which the loop wakes up to heartbeat and check for shutdown.
//!
//! The loop heartbeats the watchdog on every poll, including while it backs off
//! between bind attempts, so only a stalled cycle trips it.
//!
//! A pending read is abandoned on shutdown or forced rebind. Once a complete frame
//! has been collected, its dispatch and reply always run to completion.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{Parity, SerialConfig, ServerConfig};
use crate::constants::MAX_RTU_FRAME_SIZE;
use crate::dispatcher::FunctionDispatcher;
use crate::error::{ModbusError, ModbusResult};
use crate::health::HealthSupervisor;
use crate::logging::{log_packet, PacketDirection};
use crate::redundancy::{FailoverDecision, RedundancyManager};

/// Byte stream to the bus
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialLink for T {}

/// Opens serial endpoints by device path
pub trait SerialConnector: Send + Sync {
    fn open(&self, port: &str, serial: &SerialConfig) -> ModbusResult<Box<dyn SerialLink>>;
}

/// Real serial ports through `tokio-serial`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSerialConnector;

impl SerialConnector for TokioSerialConnector {
    fn open(&self, port: &str, serial: &SerialConfig) -> ModbusResult<Box<dyn SerialLink>> {
        let data_bits = match serial.bytesize {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match serial.stopbits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let parity = match serial.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };

        let builder = tokio_serial::new(port, serial.baudrate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .timeout(serial.poll_timeout());

        let stream = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            ModbusError::connection(format!("Failed to open serial port {}: {}", port, e))
        })?;
        Ok(Box::new(stream))
    }
}

/// Transport loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// No endpoint bound
    Idle,
    /// Waiting for a frame on the bound endpoint
    Listening,
    /// Dispatching a complete frame
    Processing,
    /// Endpoint failing; rebinding
    Degraded,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Why the serve phase ended
enum ServeExit {
    Shutdown,
    Degraded,
    Failback,
}

/// What to do after a degraded episode
enum Recovery {
    Rebind,
    Stop,
}

/// The RTU event loop of one serial endpoint
pub struct TransportLoop {
    config: Arc<ServerConfig>,
    dispatcher: FunctionDispatcher,
    connector: Arc<dyn SerialConnector>,
    redundancy: Arc<RedundancyManager>,
    health: Option<Arc<HealthSupervisor>>,
    state_tx: watch::Sender<LoopState>,
}

impl TransportLoop {
    pub fn new(
        config: Arc<ServerConfig>,
        dispatcher: FunctionDispatcher,
        connector: Arc<dyn SerialConnector>,
        redundancy: Arc<RedundancyManager>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LoopState::Idle);
        Self {
            config,
            dispatcher,
            connector,
            redundancy,
            health: None,
            state_tx,
        }
    }

    /// Report heartbeats to, and accept throttling and rebind requests from, `health`
    pub fn with_health(mut self, health: Arc<HealthSupervisor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> LoopState {
        *self.state_tx.borrow()
    }

    fn heartbeat(&self) {
        if let Some(health) = &self.health {
            health.heartbeat();
        }
    }

    fn set_state(&self, state: LoopState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Transport state: {} -> {}", previous, state);
        }
    }

    /// Run until shutdown (`Ok`) or until no endpoint can be bound (`Err`).
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> ModbusResult<()> {
        let rebind = self.health.as_ref().map(|health| health.rebind_signal());
        let base_delay = Duration::from_millis(self.config.server.reconnect_delay_ms);
        let mut reconnect_delay = base_delay;

        loop {
            self.heartbeat();
            let port = self.redundancy.active_port().to_string();
            let mut link = match self.connector.open(&port, &self.config.serial) {
                Ok(link) => {
                    info!(
                        "Listening on {} ({} endpoint, {} baud)",
                        port,
                        self.redundancy.active_endpoint(),
                        self.config.serial.baudrate
                    );
                    reconnect_delay = base_delay;
                    self.set_state(LoopState::Listening);
                    link
                }
                Err(e) => {
                    warn!("Cannot bind {}: {}", port, e);
                    match self.recover(&mut reconnect_delay, &mut shutdown).await? {
                        Recovery::Rebind => continue,
                        Recovery::Stop => break,
                    }
                }
            };

            match self.serve(&mut link, &mut shutdown, rebind.as_deref()).await {
                ServeExit::Shutdown => break,
                ServeExit::Failback => {
                    info!("Rebinding to {}", self.redundancy.active_port());
                }
                ServeExit::Degraded => {
                    drop(link);
                    match self.recover(&mut reconnect_delay, &mut shutdown).await? {
                        Recovery::Rebind => {}
                        Recovery::Stop => break,
                    }
                }
            }
        }

        self.set_state(LoopState::Idle);
        info!("Transport loop stopped");
        Ok(())
    }

    /// Degraded episode: count the failure, fail over or back off.
    async fn recover(
        &self,
        reconnect_delay: &mut Duration,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> ModbusResult<Recovery> {
        self.set_state(LoopState::Degraded);
        match self.redundancy.record_failure() {
            FailoverDecision::Fatal => {
                self.set_state(LoopState::Idle);
                error!("No serial endpoint reachable, giving up");
                Err(ModbusError::connection(format!(
                    "serial endpoint {} unreachable and no redundant endpoint left",
                    self.redundancy.active_port()
                )))
            }
            FailoverDecision::SwitchedTo(endpoint) => {
                info!(
                    "Switched to {} endpoint {}",
                    endpoint,
                    self.redundancy.port_for(endpoint)
                );
                *reconnect_delay = Duration::from_millis(self.config.server.reconnect_delay_ms);
                Ok(Recovery::Rebind)
            }
            FailoverDecision::Continue => {
                debug!("Retrying in {:?}", reconnect_delay);
                if !self.back_off(*reconnect_delay, shutdown).await {
                    return Ok(Recovery::Stop);
                }
                let max = Duration::from_millis(self.config.server.max_reconnect_delay_ms);
                *reconnect_delay = (*reconnect_delay * 2).min(max);
                Ok(Recovery::Rebind)
            }
        }
    }

    /// Sleep for `delay`, heartbeating every poll interval. Returns `false` on shutdown.
    async fn back_off(&self, delay: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        let mut beat = tokio::time::interval(self.config.serial.poll_timeout());
        loop {
            self.heartbeat();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                _ = beat.tick() => {}
                _ = shutdown.recv() => return false,
            }
        }
    }

    fn watchdog_trips(&self) -> u64 {
        self.health.as_ref().map_or(0, |health| health.watchdog_trips())
    }

    /// Listening/Processing cycle on a bound link
    async fn serve(
        &self,
        link: &mut Box<dyn SerialLink>,
        shutdown: &mut broadcast::Receiver<()>,
        rebind: Option<&Notify>,
    ) -> ServeExit {
        let serial = &self.config.serial;
        let poll_timeout = serial.poll_timeout();
        let frame_gap = serial.inter_frame_timeout();
        let threshold = self.config.server.degraded_threshold.max(1);
        let mut io_failures = 0u32;
        let trips_at_bind = self.watchdog_trips();

        loop {
            self.heartbeat();
            if let Some(health) = &self.health {
                if health.is_throttled() {
                    tokio::time::sleep(self.config.pi_zero_optimization.throttle_delay()).await;
                }
            }
            if self.redundancy.maybe_failback(Instant::now()).is_some() {
                return ServeExit::Failback;
            }

            let read = tokio::select! {
                _ = shutdown.recv() => return ServeExit::Shutdown,
                _ = wait_for_rebind(rebind) => {
                    if self.watchdog_trips() > trips_at_bind {
                        warn!("Watchdog forced a rebind");
                        return ServeExit::Degraded;
                    }
                    debug!("Ignoring watchdog signal raised before this bind");
                    continue;
                }
                read = read_frame(link, poll_timeout, frame_gap) => read,
            };

            let result = match read {
                Ok(None) => continue,
                Ok(Some((frame, received_at))) => {
                    self.set_state(LoopState::Processing);
                    let result = self.process(link, &frame, received_at, poll_timeout).await;
                    self.set_state(LoopState::Listening);
                    result
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    io_failures = 0;
                    self.redundancy.record_success();
                }
                Err(e) => {
                    io_failures += 1;
                    warn!("Serial I/O failure {}/{}: {}", io_failures, threshold, e);
                    if self.redundancy.in_failback_trial() {
                        return ServeExit::Degraded;
                    }
                    if io_failures >= threshold {
                        error!("Serial endpoint degraded after {} failures", io_failures);
                        return ServeExit::Degraded;
                    }
                }
            }
        }
    }

    /// Dispatch one frame and write the reply, if any
    async fn process(
        &self,
        link: &mut Box<dyn SerialLink>,
        frame: &[u8],
        received_at: Instant,
        write_timeout: Duration,
    ) -> ModbusResult<()> {
        let packet_logging = self.config.serial.packet_logging;
        if packet_logging {
            log_packet(PacketDirection::Recv, frame);
        }

        let Some(response) = self.dispatcher.process_frame(frame, received_at) else {
            return Ok(());
        };

        if packet_logging {
            log_packet(PacketDirection::Send, &response);
        }
        timeout(write_timeout, async {
            link.write_all(&response).await?;
            link.flush().await
        })
        .await
        .map_err(|_| ModbusError::timeout("write response", write_timeout.as_millis() as u64))??;
        Ok(())
    }
}

async fn wait_for_rebind(rebind: Option<&Notify>) {
    match rebind {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

/// Collect one frame delimited by line silence.
///
/// Returns `Ok(None)` if no byte arrived within `poll_timeout`. Bytes beyond the RTU
/// size limit are discarded, leaving an oversized frame for the codec to reject.
async fn read_frame(
    link: &mut Box<dyn SerialLink>,
    poll_timeout: Duration,
    frame_gap: Duration,
) -> ModbusResult<Option<(Vec<u8>, Instant)>> {
    let mut buffer = [0u8; MAX_RTU_FRAME_SIZE];

    let n = match timeout(poll_timeout, link.read(&mut buffer)).await {
        Err(_) => return Ok(None),
        Ok(Ok(0)) => return Err(ModbusError::connection("serial endpoint closed")),
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(ModbusError::io(format!("Serial read error: {}", e))),
    };
    let received_at = Instant::now();
    let mut frame = buffer[..n].to_vec();

    loop {
        match timeout(frame_gap, link.read(&mut buffer)).await {
            // Silence: end of frame
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let room = (MAX_RTU_FRAME_SIZE + 1).saturating_sub(frame.len());
                frame.extend_from_slice(&buffer[..n.min(room)]);
            }
            Ok(Err(e)) => return Err(ModbusError::io(format!("Serial read error: {}", e))),
        }
    }

    debug!("RTU frame received: {} bytes", frame.len());
    Ok(Some((frame, received_at)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::verify_crc;
    use crate::registry::SlaveRegistry;
    use crate::store::SlaveConfig;
    use crate::health::ResourceSample;
    use crate::redundancy::Endpoint;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream};

    const PRIMARY: &str = "/dev/ttyUSB0";
    const SECONDARY: &str = "/dev/ttyUSB1";
    const READ_HOLDING: [u8; 8] = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B];

    /// Hands out prepared duplex ends per port, failing once a port runs out
    #[derive(Default)]
    struct QueueConnector {
        links: Mutex<HashMap<String, VecDeque<DuplexStream>>>,
        opened: Mutex<Vec<String>>,
    }

    impl QueueConnector {
        fn new(links: Vec<DuplexStream>) -> Self {
            let connector = Self::default();
            for link in links {
                connector.push(PRIMARY, link);
            }
            connector
        }

        fn push(&self, port: &str, link: DuplexStream) {
            self.links
                .lock()
                .unwrap()
                .entry(port.to_string())
                .or_default()
                .push_back(link);
        }

        fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    impl SerialConnector for QueueConnector {
        fn open(&self, port: &str, _serial: &SerialConfig) -> ModbusResult<Box<dyn SerialLink>> {
            self.opened.lock().unwrap().push(port.to_string());
            let link = self
                .links
                .lock()
                .unwrap()
                .get_mut(port)
                .and_then(VecDeque::pop_front);
            match link {
                Some(link) => Ok(Box::new(link)),
                None => Err(ModbusError::connection(format!("{} not present", port))),
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
        config.server.degraded_threshold = 1;
        config.industrial_features.failover_threshold = 1;
        config
    }

    fn dispatcher() -> FunctionDispatcher {
        let registry = Arc::new(SlaveRegistry::default());
        let mut slave = SlaveConfig::new(1, "meter");
        slave.holding_registers.insert(0, 100);
        slave.holding_registers.insert(1, 200);
        registry.add_slave(slave).unwrap();
        FunctionDispatcher::new(registry)
    }

    #[tokio::test]
    async fn test_serves_request_and_stops() {
        let (mut master, slave_end) = duplex(512);
        let config = Arc::new(config());
        let connector = Arc::new(QueueConnector::new(vec![slave_end]));
        let redundancy = Arc::new(RedundancyManager::from_config(&config));
        let transport = TransportLoop::new(config, dispatcher(), connector, redundancy);
        let mut states = transport.subscribe();

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(transport.run(rx));

        states
            .wait_for(|state| *state == LoopState::Listening)
            .await
            .unwrap();

        master
            .write_all(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B])
            .await
            .unwrap();
        let mut response = [0u8; 9];
        timeout(Duration::from_secs(1), master.read_exact(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&response[..7], &[0x01, 0x03, 0x04, 0x00, 0x64, 0x00, 0xC8]);
        assert!(verify_crc(&response));

        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
        assert_eq!(*states.borrow(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_fails_over_then_reports_fatal() {
        let mut config = config();
        config.industrial_features.enable_redundancy = true;
        config.industrial_features.redundant_port = Some(SECONDARY.to_string());
        let config = Arc::new(config);

        let connector = Arc::new(QueueConnector::default());
        let redundancy = Arc::new(RedundancyManager::from_config(&config));
        let transport = TransportLoop::new(
            config,
            dispatcher(),
            Arc::clone(&connector) as Arc<dyn SerialConnector>,
            Arc::clone(&redundancy),
        );

        let (_tx, rx) = broadcast::channel(1);
        let result = timeout(Duration::from_secs(5), transport.run(rx)).await.unwrap();
        assert!(matches!(result, Err(ModbusError::Connection { .. })));

        let opened = connector.opened();
        assert_eq!(opened.first().map(String::as_str), Some(PRIMARY));
        assert_eq!(opened.last().map(String::as_str), Some(SECONDARY));
    }

    #[tokio::test]
    async fn test_closed_link_degrades_and_rebinds() {
        let (master, first) = duplex(512);
        let (mut master2, second) = duplex(512);
        drop(master);

        let mut config = config();
        config.industrial_features.failover_threshold = 5;
        let config = Arc::new(config);
        let connector = Arc::new(QueueConnector::new(vec![first, second]));
        let redundancy = Arc::new(RedundancyManager::from_config(&config));
        let transport = TransportLoop::new(config, dispatcher(), connector, Arc::clone(&redundancy));

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(transport.run(rx));

        // The second link is served once the first one is found closed
        master2
            .write_all(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B])
            .await
            .unwrap();
        let mut response = [0u8; 9];
        timeout(Duration::from_secs(2), master2.read_exact(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response[1], 0x03);

        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
        assert_eq!(redundancy.state().consecutive_failure_count, 0);
    }

    async fn exchange(master: &mut DuplexStream) -> [u8; 9] {
        master.write_all(&READ_HOLDING).await.unwrap();
        let mut response = [0u8; 9];
        timeout(Duration::from_secs(2), master.read_exact(&mut response))
            .await
            .expect("no response")
            .unwrap();
        response
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        timeout(Duration::from_secs(3), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never met");
    }

    #[tokio::test]
    async fn test_watchdog_trip_rebinds_once_on_same_port() {
        let (_first_master, first) = duplex(512);
        let (mut master, second) = duplex(512);
        let config = Arc::new(config());
        let connector = Arc::new(QueueConnector::new(vec![first, second]));
        let redundancy = Arc::new(RedundancyManager::from_config(&config));
        let health = Arc::new(HealthSupervisor::new(Arc::clone(&config)));
        let transport = TransportLoop::new(
            config,
            dispatcher(),
            Arc::clone(&connector) as Arc<dyn SerialConnector>,
            Arc::clone(&redundancy),
        )
        .with_health(Arc::clone(&health));
        let mut states = transport.subscribe();

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(transport.run(rx));
        states
            .wait_for(|state| *state == LoopState::Listening)
            .await
            .unwrap();

        assert!(health.check_watchdog(tokio::time::Instant::now() + Duration::from_secs(60)));
        wait_until(|| connector.opened().len() == 2).await;
        states
            .wait_for(|state| *state == LoopState::Listening)
            .await
            .unwrap();

        let response = exchange(&mut master).await;
        assert_eq!(&response[..7], &[0x01, 0x03, 0x04, 0x00, 0x64, 0x00, 0xC8]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(connector.opened(), vec![PRIMARY.to_string(), PRIMARY.to_string()]);
        assert_eq!(health.watchdog_trips(), 1);
        assert_eq!(redundancy.state().consecutive_failure_count, 0);

        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_watchdog_signal_from_backoff_does_not_drop_next_bind() {
        let (mut master, link) = duplex(512);
        let mut config = config();
        config.industrial_features.watchdog_timeout = 1;
        config.server.reconnect_delay_ms = 500;
        config.server.max_reconnect_delay_ms = 500;
        config.industrial_features.failover_threshold = 3;
        let config = Arc::new(config);

        // First bind fails, the loop backs off before the second one
        let connector = Arc::new(QueueConnector::default());
        let redundancy = Arc::new(RedundancyManager::from_config(&config));
        let health = Arc::new(HealthSupervisor::new(Arc::clone(&config)));
        let transport = TransportLoop::new(
            config,
            dispatcher(),
            Arc::clone(&connector) as Arc<dyn SerialConnector>,
            Arc::clone(&redundancy),
        )
        .with_health(Arc::clone(&health));
        let mut states = transport.subscribe();

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(transport.run(rx));
        states
            .wait_for(|state| *state == LoopState::Degraded)
            .await
            .unwrap();
        connector.push(PRIMARY, link);

        // Heartbeats continue while backing off
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!health.check_watchdog(tokio::time::Instant::now() + Duration::from_millis(800)));

        // A trip raised now is stale by the time the next bind succeeds
        assert!(health.check_watchdog(tokio::time::Instant::now() + Duration::from_secs(60)));
        wait_until(|| connector.opened().len() == 2).await;
        states
            .wait_for(|state| *state == LoopState::Listening)
            .await
            .unwrap();

        let response = exchange(&mut master).await;
        assert_eq!(response[1], 0x03);
        assert_eq!(connector.opened().len(), 2);
        assert_eq!(*states.borrow(), LoopState::Listening);
        assert!(!task.is_finished());

        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_requested_failback_rebinds_to_primary() {
        let (_secondary_master, secondary) = duplex(512);
        let (mut master, primary) = duplex(512);
        let mut config = config();
        config.industrial_features.enable_redundancy = true;
        config.industrial_features.redundant_port = Some(SECONDARY.to_string());
        config.industrial_features.failover_threshold = 0;
        let config = Arc::new(config);

        let connector = Arc::new(QueueConnector::default());
        connector.push(SECONDARY, secondary);
        let redundancy = Arc::new(RedundancyManager::from_config(&config));
        let transport = TransportLoop::new(
            config,
            dispatcher(),
            Arc::clone(&connector) as Arc<dyn SerialConnector>,
            Arc::clone(&redundancy),
        );
        let mut states = transport.subscribe();

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(transport.run(rx));
        states
            .wait_for(|state| *state == LoopState::Listening)
            .await
            .unwrap();
        assert_eq!(redundancy.active_endpoint(), Endpoint::Secondary);

        connector.push(PRIMARY, primary);
        redundancy.request_failback();
        wait_until(|| connector.opened().len() == 3).await;

        let response = exchange(&mut master).await;
        assert_eq!(response[1], 0x03);
        assert_eq!(connector.opened(), vec![PRIMARY, SECONDARY, PRIMARY]);
        assert_eq!(redundancy.active_endpoint(), Endpoint::Primary);
        assert!(!redundancy.in_failback_trial());

        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    fn cooldown_transport(connector: &Arc<QueueConnector>) -> (TransportLoop, Arc<RedundancyManager>) {
        let config = Arc::new(config());
        let redundancy = Arc::new(RedundancyManager::new(
            PRIMARY,
            Some(SECONDARY.to_string()),
            0,
            Some(Duration::from_millis(200)),
        ));
        let transport = TransportLoop::new(
            config,
            dispatcher(),
            Arc::clone(connector) as Arc<dyn SerialConnector>,
            Arc::clone(&redundancy),
        );
        (transport, redundancy)
    }

    #[tokio::test]
    async fn test_cooldown_failback_commits_on_primary_traffic() {
        let (_secondary_master, secondary) = duplex(512);
        let (mut master, primary) = duplex(512);
        let connector = Arc::new(QueueConnector::default());
        connector.push(SECONDARY, secondary);
        let (transport, redundancy) = cooldown_transport(&connector);

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(transport.run(rx));
        wait_until(|| redundancy.active_endpoint() == Endpoint::Secondary).await;

        connector.push(PRIMARY, primary);
        wait_until(|| connector.opened().len() == 3).await;
        assert!(redundancy.in_failback_trial());

        let response = exchange(&mut master).await;
        assert_eq!(response[1], 0x03);
        assert_eq!(redundancy.active_endpoint(), Endpoint::Primary);
        assert!(!redundancy.in_failback_trial());

        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_failed_cooldown_trial_returns_to_secondary() {
        let connector = Arc::new(QueueConnector::default());
        let mut masters = Vec::new();
        for _ in 0..3 {
            let (master, secondary) = duplex(512);
            masters.push(master);
            connector.push(SECONDARY, secondary);
        }
        let (transport, redundancy) = cooldown_transport(&connector);

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(transport.run(rx));

        // Primary is never present: the trial bind fails without counting toward fatal
        wait_until(|| connector.opened().len() >= 4).await;
        assert_eq!(
            connector.opened()[..4],
            [PRIMARY, SECONDARY, PRIMARY, SECONDARY]
        );
        assert_eq!(redundancy.active_endpoint(), Endpoint::Secondary);
        assert!(!task.is_finished());

        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_throttling_delays_reply() {
        let (mut master, link) = duplex(512);
        let mut config = config();
        config.serial.timeout = 2.0;
        config.pi_zero_optimization.throttle_delay_ms = 400;
        let config = Arc::new(config);

        let health = Arc::new(HealthSupervisor::new(Arc::clone(&config)));
        health.apply_sample(ResourceSample {
            cpu_percent: 10.0,
            memory_used_mb: 64,
            swap_percent: 0.0,
            temperature_c: Some(90.0),
        });
        assert!(health.is_throttled());

        let connector = Arc::new(QueueConnector::new(vec![link]));
        let redundancy = Arc::new(RedundancyManager::from_config(&config));
        let transport =
            TransportLoop::new(config, dispatcher(), connector, redundancy).with_health(health);
        let mut states = transport.subscribe();

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(transport.run(rx));
        states
            .wait_for(|state| *state == LoopState::Listening)
            .await
            .unwrap();

        let started = Instant::now();
        let response = exchange(&mut master).await;
        assert_eq!(response[1], 0x03);
        assert!(started.elapsed() >= Duration::from_millis(300));

        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }
}
