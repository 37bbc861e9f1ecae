//! # Snapshot Scheduler
//!
//! Periodically copies the configuration and every slave's registers into an
//! immutable [`RegistrySnapshot`] and hands it to a [`SnapshotSink`].
//!
//! Slaves are copied one at a time. Each copy holds that slave's register lock in
//! shared (read) mode, which still excludes every writer, so a slave's copy is as
//! consistent as one taken under an exclusive lock while other readers keep going.
//! There is no registry-wide lock: a snapshot is consistent per slave but not
//! across slaves.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::error::ModbusResult;
use crate::registry::SlaveRegistry;
use crate::store::SlaveConfig;

/// Point-in-time copy of the server state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub taken_at: DateTime<Utc>,
    pub config: ServerConfig,
    pub slaves: Vec<SlaveConfig>,
}

impl RegistrySnapshot {
    pub fn capture(config: &ServerConfig, registry: &SlaveRegistry) -> Self {
        Self {
            taken_at: Utc::now(),
            config: config.clone(),
            slaves: registry.snapshot(),
        }
    }
}

/// Receiver of snapshots (backup storage)
pub trait SnapshotSink: Send + Sync {
    fn store(&self, snapshot: &RegistrySnapshot) -> ModbusResult<()>;
}

/// Writes each snapshot as `snapshot_YYYYmmdd_HHMMSS.json` into a directory
#[derive(Debug, Clone)]
pub struct DirectorySink {
    directory: PathBuf,
}

impl DirectorySink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, snapshot: &RegistrySnapshot) -> PathBuf {
        self.directory.join(format!(
            "snapshot_{}.json",
            snapshot.taken_at.format("%Y%m%d_%H%M%S")
        ))
    }
}

impl SnapshotSink for DirectorySink {
    fn store(&self, snapshot: &RegistrySnapshot) -> ModbusResult<()> {
        std::fs::create_dir_all(&self.directory)?;
        let path = self.path_for(snapshot);
        let text = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&path, text)?;
        info!("Snapshot of {} slaves written to {}", snapshot.slaves.len(), path.display());
        Ok(())
    }
}

/// Periodic snapshot task
pub struct SnapshotScheduler {
    config: Arc<ServerConfig>,
    registry: Arc<SlaveRegistry>,
    sink: Box<dyn SnapshotSink>,
    period: Duration,
}

impl SnapshotScheduler {
    pub fn new(
        config: Arc<ServerConfig>,
        registry: Arc<SlaveRegistry>,
        sink: Box<dyn SnapshotSink>,
    ) -> Self {
        let period = config.server.backup_interval();
        Self {
            config,
            registry,
            sink,
            period,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Capture one snapshot and hand it to the sink
    pub fn snapshot_now(&self) -> ModbusResult<RegistrySnapshot> {
        let snapshot = RegistrySnapshot::capture(&self.config, &self.registry);
        self.sink.store(&snapshot)?;
        Ok(snapshot)
    }

    /// Snapshot every period until shutdown. Sink failures are logged, not fatal.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!("Snapshot scheduler started, period {:?}", self.period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.snapshot_now() {
                        error!("Snapshot failed: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Snapshot scheduler stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RegisterSpace;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink(Mutex<Vec<RegistrySnapshot>>);

    impl SnapshotSink for Arc<MemorySink> {
        fn store(&self, snapshot: &RegistrySnapshot) -> ModbusResult<()> {
            self.0.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    fn registry() -> Arc<SlaveRegistry> {
        let registry = Arc::new(SlaveRegistry::default());
        registry.add_slave(SlaveConfig::example(1)).unwrap();
        registry
    }

    #[test]
    fn test_directory_sink_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("backups"));
        let snapshot = RegistrySnapshot::capture(&ServerConfig::default(), &registry());

        sink.store(&snapshot).unwrap();

        let path = sink.path_for(&snapshot);
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("snapshot_"));
        let loaded: RegistrySnapshot =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(loaded.slaves, snapshot.slaves);
        assert_eq!(loaded.slaves[0].holding_registers.get(&2016), Some(&1000));
    }

    #[test]
    fn test_snapshot_is_immutable_copy() {
        let registry = registry();
        let snapshot = RegistrySnapshot::capture(&ServerConfig::default(), &registry);
        registry
            .update_register(1, RegisterSpace::HoldingRegisters, 2016, 5u16.into())
            .unwrap();
        assert_eq!(snapshot.slaves[0].holding_registers.get(&2016), Some(&1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_runs_periodically() {
        let sink = Arc::new(MemorySink::default());
        let scheduler = SnapshotScheduler::new(
            Arc::new(ServerConfig::default()),
            registry(),
            Box::new(Arc::clone(&sink)),
        )
        .with_period(Duration::from_secs(10));

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }
}
