//! # Slave Bank Server
//!
//! Process-level façade: owns the registry, the redundancy and health state, and the
//! background tasks.
//!
//! | Task | Period | Started when |
//! |------|--------|--------------|
//! | transport loop | continuous | always |
//! | health supervisor | `check_interval` / watchdog | always |
//! | snapshot scheduler | `backup_interval` | `enable_backup` |
//! | statistics report | `stats_interval` | always |
//!
//! All tasks share one broadcast shutdown channel. The transport loop is the only task
//! that can fail; its fatal error is returned by [`SlaveBankServer::wait`] so the host
//! process can exit and let its supervisor restart it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::FunctionDispatcher;
use crate::error::{ModbusError, ModbusResult, RegistryError, UpdateError};
use crate::health::{HealthState, HealthSupervisor, ResourceProbe, SystemProbe};
use crate::protocol::{RegisterSpace, RegisterValue, SlaveId};
use crate::redundancy::{RedundancyManager, TransportState};
use crate::registry::{SlaveRegistry, SnapshotView};
use crate::snapshot::{DirectorySink, SnapshotScheduler, SnapshotSink};
use crate::stats::Statistics;
use crate::store::SlaveConfig;
use crate::transport::{LoopState, SerialConnector, TokioSerialConnector, TransportLoop};

/// Multi-slave Modbus RTU server
pub struct SlaveBankServer {
    config: Arc<ServerConfig>,
    registry: Arc<SlaveRegistry>,
    redundancy: Arc<RedundancyManager>,
    health: Arc<HealthSupervisor>,
    connector: Arc<dyn SerialConnector>,
    probe: Option<Box<dyn ResourceProbe>>,
    snapshot_sink: Option<Box<dyn SnapshotSink>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
    start_time: Option<Instant>,
    loop_state: Option<watch::Receiver<LoopState>>,
    transport_task: Option<JoinHandle<ModbusResult<()>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SlaveBankServer {
    /// Create a server and register the slaves listed in the configuration
    pub fn new(config: ServerConfig) -> ModbusResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let registry = Arc::new(SlaveRegistry::new(config.server.max_slaves));
        for slave in &config.slaves {
            registry.add_slave(slave.clone())?;
        }

        Ok(Self {
            redundancy: Arc::new(RedundancyManager::from_config(&config)),
            health: Arc::new(HealthSupervisor::new(Arc::clone(&config))),
            registry,
            config,
            connector: Arc::new(TokioSerialConnector),
            probe: None,
            snapshot_sink: None,
            shutdown_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            start_time: None,
            loop_state: None,
            transport_task: None,
            tasks: Vec::new(),
        })
    }

    /// Use a custom serial connector (tests, pseudo-terminals)
    pub fn with_connector(mut self, connector: Arc<dyn SerialConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Use a custom resource probe instead of the host probe
    pub fn with_probe(mut self, probe: Box<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Use a custom snapshot sink instead of `backup_directory`
    pub fn with_snapshot_sink(mut self, sink: Box<dyn SnapshotSink>) -> Self {
        self.snapshot_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SlaveRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Collaborator operations
    // ------------------------------------------------------------------

    pub fn add_slave(&self, config: SlaveConfig) -> Result<(), RegistryError> {
        self.registry.add_slave(config)
    }

    pub fn remove_slave(&self, slave_id: SlaveId) -> Result<(), RegistryError> {
        self.registry.remove_slave(slave_id)
    }

    pub fn get_slave_data(&self, slave_id: SlaveId) -> Result<SnapshotView, RegistryError> {
        self.registry.get_slave_data(slave_id)
    }

    pub fn update_register(
        &self,
        slave_id: SlaveId,
        space: RegisterSpace,
        address: u16,
        value: RegisterValue,
    ) -> Result<(), UpdateError> {
        self.registry.update_register(slave_id, space, address, value)
    }

    pub fn update_file_record(
        &self,
        slave_id: SlaveId,
        file_number: u16,
        record_number: u16,
        content: Bytes,
    ) -> Result<(), RegistryError> {
        self.registry
            .update_file_record(slave_id, file_number, record_number, content)
    }

    pub fn get_statistics(&self, slave_id: SlaveId) -> Result<Statistics, RegistryError> {
        self.registry.get_statistics(slave_id)
    }

    // ------------------------------------------------------------------
    // Supervision state
    // ------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Time since `start_server`, while running
    pub fn uptime(&self) -> Option<Duration> {
        self.start_time
            .filter(|_| self.is_running())
            .map(|start| start.elapsed())
    }

    pub fn transport_state(&self) -> TransportState {
        self.redundancy.state()
    }

    pub fn loop_state(&self) -> LoopState {
        self.loop_state
            .as_ref()
            .map_or(LoopState::Idle, |rx| *rx.borrow())
    }

    pub fn health_state(&self) -> HealthState {
        self.health.state()
    }

    /// Return to the primary endpoint at the transport loop's next iteration
    pub fn request_failback(&self) {
        self.redundancy.request_failback();
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bind the transport loop and start the background tasks
    pub async fn start_server(&mut self) -> ModbusResult<()> {
        if self.is_running() {
            return Err(ModbusError::internal("Server is already running"));
        }
        // A previous run may have failed over or given up
        self.redundancy.reset();

        info!(
            "Starting Modbus RTU slave bank on {} with {} slaves",
            self.redundancy.active_port(),
            self.registry.len()
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        self.start_time = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);

        let dispatcher = FunctionDispatcher::with_response_timeout(
            Arc::clone(&self.registry),
            self.config.server.response_timeout(),
        );
        let transport = TransportLoop::new(
            Arc::clone(&self.config),
            dispatcher,
            Arc::clone(&self.connector),
            Arc::clone(&self.redundancy),
        )
        .with_health(Arc::clone(&self.health));
        self.loop_state = Some(transport.subscribe());

        let running = Arc::clone(&self.running);
        let shutdown_rx = shutdown_tx.subscribe();
        self.transport_task = Some(tokio::spawn(async move {
            let result = transport.run(shutdown_rx).await;
            running.store(false, Ordering::SeqCst);
            if let Err(e) = &result {
                error!("Transport loop terminated: {}", e);
            }
            result
        }));

        let probe = self
            .probe
            .take()
            .unwrap_or_else(|| Box::new(SystemProbe::new()));
        self.tasks.push(tokio::spawn(
            Arc::clone(&self.health).run(probe, shutdown_tx.subscribe()),
        ));

        if self.config.industrial_features.enable_backup {
            let sink = self.snapshot_sink.take().unwrap_or_else(|| {
                Box::new(DirectorySink::new(
                    self.config.industrial_features.backup_directory.clone(),
                ))
            });
            let scheduler =
                SnapshotScheduler::new(Arc::clone(&self.config), Arc::clone(&self.registry), sink);
            self.tasks.push(tokio::spawn(scheduler.run(shutdown_tx.subscribe())));
        }

        self.tasks.push(tokio::spawn(report_statistics_periodically(
            Arc::clone(&self.registry),
            self.config.server.stats_interval(),
            shutdown_tx.subscribe(),
        )));

        self.shutdown_tx = Some(shutdown_tx);
        info!("Modbus RTU slave bank started");
        Ok(())
    }

    /// Stop every task and unbind the serial endpoint
    pub async fn stop_server(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        let mut result = Ok(());
        if let Some(task) = self.transport_task.take() {
            result = join_transport(task).await;
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        report_statistics(&self.registry);
        info!("Modbus RTU slave bank stopped");
        result
    }

    /// Wait until the transport loop exits on its own.
    ///
    /// Returns the fatal transport error, if that is why it stopped.
    pub async fn wait(&mut self) -> ModbusResult<()> {
        match self.transport_task.as_mut() {
            Some(task) => {
                let result = match task.await {
                    Ok(result) => result,
                    Err(e) => Err(ModbusError::internal(format!("transport task failed: {}", e))),
                };
                self.transport_task = None;
                result
            }
            None => Ok(()),
        }
    }
}

async fn join_transport(task: JoinHandle<ModbusResult<()>>) -> ModbusResult<()> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(ModbusError::internal(format!("transport task failed: {}", e))),
    }
}

/// Log aggregate and per-slave statistics
pub fn report_statistics(registry: &SlaveRegistry) {
    let all = registry.all_statistics();
    let mut total = Statistics::default();
    for (_, stats) in &all {
        total.accumulate(stats);
    }

    info!(
        "Statistics: {} slaves, {} requests, {} ok, {} errors, success rate {:.1}%",
        all.len(),
        total.total_requests,
        total.successful_requests,
        total.error_requests.total(),
        total.success_rate()
    );
    for (slave_id, stats) in all.iter().filter(|(_, s)| s.total_requests > 0) {
        info!(
            "  slave {}: {} requests, {:.1}% ok, {} bytes in, {} bytes out",
            slave_id,
            stats.total_requests,
            stats.success_rate(),
            stats.bytes_in,
            stats.bytes_out
        );
    }
}

async fn report_statistics_periodically(
    registry: Arc<SlaveRegistry>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => report_statistics(&registry),
            _ = shutdown.recv() => break,
        }
    }
}
