//! # Slave Registry
//!
//! Owns the set of virtual slaves served on the bus and exposes the collaborator
//! operations (`add_slave`, `remove_slave`, `get_slave_data`, `update_register`,
//! `get_statistics`).
//!
//! ## Locking
//!
//! The slave-id index has its own lock, held only to insert, remove or clone an
//! entry handle. Each slave's registers live behind that slave's own lock inside its
//! [`RegisterStore`], and its statistics behind a separate mutex. Operations on
//! different slaves never contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::constants::{MAX_SLAVE_ID, MIN_SLAVE_ID};
use crate::error::{RegistryError, UpdateError};
use crate::protocol::{RegisterSpace, RegisterValue, SlaveId};
use crate::stats::Statistics;
use crate::store::{RegisterCounts, RegisterStore, SlaveConfig};

/// One registered slave: identity, registers and statistics
#[derive(Debug)]
pub struct SlaveEntry {
    slave_id: SlaveId,
    name: String,
    description: String,
    store: RegisterStore,
    stats: Mutex<Statistics>,
}

impl SlaveEntry {
    fn new(config: &SlaveConfig) -> Self {
        Self {
            slave_id: config.slave_id,
            name: config.name.clone(),
            description: config.description.clone(),
            store: RegisterStore::from_config(config),
            stats: Mutex::new(Statistics::default()),
        }
    }

    pub fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register store of this slave
    pub fn store(&self) -> &RegisterStore {
        &self.store
    }

    /// Locked statistics; hold the guard only for the update itself
    pub fn stats(&self) -> MutexGuard<'_, Statistics> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current statistics
    pub fn statistics(&self) -> Statistics {
        self.stats().clone()
    }

    /// Point-in-time copy of configuration and register contents.
    ///
    /// The register lock is held only while the store is cloned.
    pub fn to_config(&self) -> SlaveConfig {
        let data = self.store.copy_data();
        SlaveConfig {
            slave_id: self.slave_id,
            name: self.name.clone(),
            description: self.description.clone(),
            coils: data.coils,
            discrete_inputs: data.discrete_inputs,
            holding_registers: data.holding_registers,
            input_registers: data.input_registers,
            file_records: data.file_records,
            limits: self.store.limits(),
        }
    }
}

/// Registers and statistics of one slave, as handed to collaborators
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotView {
    pub taken_at: DateTime<Utc>,
    pub config: SlaveConfig,
    pub register_counts: RegisterCounts,
    pub statistics: Statistics,
}

/// Set of configured slaves, keyed by slave id
#[derive(Debug)]
pub struct SlaveRegistry {
    slaves: RwLock<HashMap<SlaveId, Arc<SlaveEntry>>>,
    max_slaves: usize,
}

impl SlaveRegistry {
    /// Create an empty registry holding at most `max_slaves` slaves
    pub fn new(max_slaves: usize) -> Self {
        Self {
            slaves: RwLock::new(HashMap::new()),
            max_slaves,
        }
    }

    pub fn max_slaves(&self) -> usize {
        self.max_slaves
    }

    /// Register a new slave.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidSlaveId`] for ids outside 1-247
    /// - [`RegistryError::DuplicateSlaveId`] if the id is already registered
    /// - [`RegistryError::CapacityExceeded`] once `max_slaves` are registered
    pub fn add_slave(&self, config: SlaveConfig) -> Result<(), RegistryError> {
        let slave_id = config.slave_id;
        if !(MIN_SLAVE_ID..=MAX_SLAVE_ID).contains(&slave_id) {
            return Err(RegistryError::InvalidSlaveId(slave_id));
        }

        let entry = Arc::new(SlaveEntry::new(&config));
        let mut slaves = self.slaves.write().unwrap_or_else(PoisonError::into_inner);
        if slaves.contains_key(&slave_id) {
            return Err(RegistryError::DuplicateSlaveId(slave_id));
        }
        if slaves.len() >= self.max_slaves {
            return Err(RegistryError::CapacityExceeded {
                max: self.max_slaves,
            });
        }
        slaves.insert(slave_id, entry);
        drop(slaves);

        info!("Added slave {} ({})", slave_id, config.name);
        Ok(())
    }

    /// Remove a slave together with its statistics
    pub fn remove_slave(&self, slave_id: SlaveId) -> Result<(), RegistryError> {
        let removed = self
            .slaves
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&slave_id);
        match removed {
            Some(entry) => {
                info!("Removed slave {} ({})", slave_id, entry.name);
                Ok(())
            }
            None => Err(RegistryError::UnknownSlave(slave_id)),
        }
    }

    /// Entry handle for a slave id, if registered
    pub fn get(&self, slave_id: SlaveId) -> Option<Arc<SlaveEntry>> {
        self.slaves
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&slave_id)
            .cloned()
    }

    fn entry(&self, slave_id: SlaveId) -> Result<Arc<SlaveEntry>, RegistryError> {
        self.get(slave_id).ok_or(RegistryError::UnknownSlave(slave_id))
    }

    pub fn contains(&self, slave_id: SlaveId) -> bool {
        self.get(slave_id).is_some()
    }

    /// Registered slave ids in ascending order
    pub fn slave_ids(&self) -> Vec<SlaveId> {
        let mut ids: Vec<_> = self
            .slaves
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.slaves.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers and statistics of one slave
    pub fn get_slave_data(&self, slave_id: SlaveId) -> Result<SnapshotView, RegistryError> {
        let entry = self.entry(slave_id)?;
        Ok(SnapshotView {
            taken_at: Utc::now(),
            config: entry.to_config(),
            register_counts: entry.store().counts(),
            statistics: entry.statistics(),
        })
    }

    /// Set a single register value on behalf of a collaborator
    pub fn update_register(
        &self,
        slave_id: SlaveId,
        space: RegisterSpace,
        address: u16,
        value: RegisterValue,
    ) -> Result<(), UpdateError> {
        let entry = self.entry(slave_id)?;
        entry.store().set_value(space, address, value)?;
        Ok(())
    }

    /// Replace a file record on behalf of a collaborator
    pub fn update_file_record(
        &self,
        slave_id: SlaveId,
        file_number: u16,
        record_number: u16,
        content: Bytes,
    ) -> Result<(), RegistryError> {
        self.entry(slave_id)?
            .store()
            .set_file_record(file_number, record_number, content);
        Ok(())
    }

    pub fn get_statistics(&self, slave_id: SlaveId) -> Result<Statistics, RegistryError> {
        Ok(self.entry(slave_id)?.statistics())
    }

    /// Statistics of every slave, ordered by slave id
    pub fn all_statistics(&self) -> Vec<(SlaveId, Statistics)> {
        self.entries()
            .into_iter()
            .map(|entry| (entry.slave_id(), entry.statistics()))
            .collect()
    }

    /// Copy every slave, locking each one only while it is copied.
    ///
    /// Each copy takes the slave's register lock for reading. Writers are excluded
    /// for its duration, so no copy ever shows a half-applied range write.
    pub fn snapshot(&self) -> Vec<SlaveConfig> {
        self.entries()
            .into_iter()
            .map(|entry| entry.to_config())
            .collect()
    }

    /// Clone the entry handles so no per-slave work happens under the index lock
    fn entries(&self) -> Vec<Arc<SlaveEntry>> {
        let mut entries: Vec<_> = self
            .slaves
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries.sort_unstable_by_key(|entry| entry.slave_id());
        entries
    }
}

impl Default for SlaveRegistry {
    fn default() -> Self {
        Self::new(MAX_SLAVE_ID as usize)
    }
}
