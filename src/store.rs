//! Per-slave register store
//!
//! Holds the four strongly-typed register spaces and the file records of one
//! virtual slave behind a single reader/writer lock:
//!
//! | Space | Value | Master access |
//! |-------|-------|---------------|
//! | coils | `bool` | read/write |
//! | discrete inputs | `bool` | read |
//! | holding registers | `u16` | read/write |
//! | input registers | `u16` | read |
//!
//! Every operation takes the lock exactly once and releases it before returning,
//! so a range read or write is atomic with respect to every other operation on
//! the same slave. Reads share the lock; writes hold it exclusively.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::device_limits::DeviceLimits;
use crate::error::{AddressError, FileError};
use crate::protocol::{RegisterSpace, RegisterValue, SlaveId};

/// file_number → record_number → record bytes
pub type FileRecords = BTreeMap<u16, BTreeMap<u16, Bytes>>;

const WRONG_SPACE_TYPE: AddressError = AddressError::IllegalValue {
    reason: "value type does not match register space",
};

/// Configuration of one virtual slave device.
///
/// This is both the startup description of a slave (from the configuration file or a
/// collaborator) and the shape of its point-in-time copy in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveConfig {
    pub slave_id: SlaveId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub coils: BTreeMap<u16, bool>,
    #[serde(default)]
    pub discrete_inputs: BTreeMap<u16, bool>,
    #[serde(default)]
    pub holding_registers: BTreeMap<u16, u16>,
    #[serde(default)]
    pub input_registers: BTreeMap<u16, u16>,
    #[serde(default)]
    pub file_records: FileRecords,
    /// Per-request quantity limits of the simulated device profile
    #[serde(default)]
    pub limits: DeviceLimits,
}

impl SlaveConfig {
    /// Create an empty slave description
    pub fn new<S: Into<String>>(slave_id: SlaveId, name: S) -> Self {
        Self {
            slave_id,
            name: name.into(),
            description: String::new(),
            coils: BTreeMap::new(),
            discrete_inputs: BTreeMap::new(),
            holding_registers: BTreeMap::new(),
            input_registers: BTreeMap::new(),
            file_records: BTreeMap::new(),
            limits: DeviceLimits::default(),
        }
    }

    /// Simulated industrial device used for bench testing and the `--example-slave` flag.
    pub fn example(slave_id: SlaveId) -> Self {
        let mut config = Self::new(slave_id, "Example Industrial Device");
        config.description = "Simulated industrial device for testing".to_string();
        config.holding_registers = BTreeMap::from([
            (2014, 16256), // float value, high word
            (2015, 17095), // float value, low word
            (2016, 1000),  // temperature sensor
            (2017, 2500),  // pressure sensor
            (2018, 750),   // flow rate
        ]);
        config.input_registers = BTreeMap::from([(3001, 25), (3002, 1013), (3003, 60)]);
        config.coils = BTreeMap::from([(1, true), (2, false), (3, true)]);
        config.discrete_inputs = BTreeMap::from([(10001, true), (10002, false), (10003, true)]);

        let mut records = BTreeMap::new();
        records.insert(0, padded(b"INDUSTRIAL_DEVICE_V1.0", 30));
        records.insert(1, padded(b"SERIAL_12345678", 28));
        records.insert(2, padded(b"CONFIG_DATA_HERE", 28));
        config.file_records.insert(1, records);
        config
    }
}

fn padded(text: &[u8], len: usize) -> Bytes {
    let mut data = text.to_vec();
    data.resize(len.max(text.len()), 0);
    Bytes::from(data)
}

/// Register contents of one slave, without identity or limits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterData {
    pub coils: BTreeMap<u16, bool>,
    pub discrete_inputs: BTreeMap<u16, bool>,
    pub holding_registers: BTreeMap<u16, u16>,
    pub input_registers: BTreeMap<u16, u16>,
    pub file_records: FileRecords,
}

impl RegisterData {
    fn bits(&self, space: RegisterSpace) -> Result<&BTreeMap<u16, bool>, AddressError> {
        match space {
            RegisterSpace::Coils => Ok(&self.coils),
            RegisterSpace::DiscreteInputs => Ok(&self.discrete_inputs),
            _ => Err(WRONG_SPACE_TYPE),
        }
    }

    fn bits_mut(&mut self, space: RegisterSpace) -> Result<&mut BTreeMap<u16, bool>, AddressError> {
        match space {
            RegisterSpace::Coils => Ok(&mut self.coils),
            RegisterSpace::DiscreteInputs => Ok(&mut self.discrete_inputs),
            _ => Err(WRONG_SPACE_TYPE),
        }
    }

    fn words(&self, space: RegisterSpace) -> Result<&BTreeMap<u16, u16>, AddressError> {
        match space {
            RegisterSpace::HoldingRegisters => Ok(&self.holding_registers),
            RegisterSpace::InputRegisters => Ok(&self.input_registers),
            _ => Err(WRONG_SPACE_TYPE),
        }
    }

    fn words_mut(&mut self, space: RegisterSpace) -> Result<&mut BTreeMap<u16, u16>, AddressError> {
        match space {
            RegisterSpace::HoldingRegisters => Ok(&mut self.holding_registers),
            RegisterSpace::InputRegisters => Ok(&mut self.input_registers),
            _ => Err(WRONG_SPACE_TYPE),
        }
    }
}

/// Number of populated addresses per space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegisterCounts {
    pub coils: usize,
    pub discrete_inputs: usize,
    pub holding_registers: usize,
    pub input_registers: usize,
    pub file_records: usize,
}

/// Thread-safe register store of a single slave
#[derive(Debug)]
pub struct RegisterStore {
    limits: DeviceLimits,
    data: RwLock<RegisterData>,
}

impl RegisterStore {
    /// Create an empty store with protocol-default limits
    pub fn new() -> Self {
        Self::with_data(RegisterData::default(), DeviceLimits::default())
    }

    /// Create a store from initial contents
    pub fn with_data(data: RegisterData, limits: DeviceLimits) -> Self {
        Self {
            limits: limits.clamped(),
            data: RwLock::new(data),
        }
    }

    /// Build a store from a slave description
    pub fn from_config(config: &SlaveConfig) -> Self {
        Self::with_data(
            RegisterData {
                coils: config.coils.clone(),
                discrete_inputs: config.discrete_inputs.clone(),
                holding_registers: config.holding_registers.clone(),
                input_registers: config.input_registers.clone(),
                file_records: config.file_records.clone(),
            },
            config.limits,
        )
    }

    /// Quantity limits applied by this store
    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, RegisterData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, RegisterData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Range reads
    // ------------------------------------------------------------------

    /// Read `count` bits from a coil or discrete input space, in address order.
    pub fn read_bits(
        &self,
        space: RegisterSpace,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, AddressError> {
        self.limits.check_coil_read(count)?;
        let addresses = address_range(start, count)?;
        let data = self.read_guard();
        let map = data.bits(space)?;
        addresses
            .map(|addr| {
                map.get(&addr)
                    .copied()
                    .ok_or(AddressError::IllegalAddress { start, count })
            })
            .collect()
    }

    /// Read `count` words from a holding or input register space, in address order.
    pub fn read_words(
        &self,
        space: RegisterSpace,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, AddressError> {
        self.limits.check_register_read(count)?;
        let addresses = address_range(start, count)?;
        let data = self.read_guard();
        let map = data.words(space)?;
        addresses
            .map(|addr| {
                map.get(&addr)
                    .copied()
                    .ok_or(AddressError::IllegalAddress { start, count })
            })
            .collect()
    }

    /// Read a range from any space as collaborator-facing values.
    pub fn read_range(
        &self,
        space: RegisterSpace,
        start: u16,
        count: u16,
    ) -> Result<Vec<RegisterValue>, AddressError> {
        if space.is_bit_space() {
            Ok(self
                .read_bits(space, start, count)?
                .into_iter()
                .map(RegisterValue::Bit)
                .collect())
        } else {
            Ok(self
                .read_words(space, start, count)?
                .into_iter()
                .map(RegisterValue::Word)
                .collect())
        }
    }

    // ------------------------------------------------------------------
    // Range writes
    // ------------------------------------------------------------------

    /// Write consecutive bits. Every target address must already be populated;
    /// nothing is written unless the whole range is valid.
    pub fn write_bits(
        &self,
        space: RegisterSpace,
        start: u16,
        values: &[bool],
    ) -> Result<(), AddressError> {
        let count = quantity(values.len())?;
        self.limits.check_coil_write(count)?;
        let addresses = address_range(start, count)?;
        let mut data = self.write_guard();
        let map = data.bits_mut(space)?;
        if !addresses.clone().all(|addr| map.contains_key(&addr)) {
            return Err(AddressError::IllegalAddress { start, count });
        }
        for (addr, &value) in addresses.zip(values) {
            map.insert(addr, value);
        }
        Ok(())
    }

    /// Write consecutive words. Every target address must already be populated;
    /// nothing is written unless the whole range is valid.
    pub fn write_words(
        &self,
        space: RegisterSpace,
        start: u16,
        values: &[u16],
    ) -> Result<(), AddressError> {
        let count = quantity(values.len())?;
        self.limits.check_register_write(count)?;
        let addresses = address_range(start, count)?;
        let mut data = self.write_guard();
        let map = data.words_mut(space)?;
        if !addresses.clone().all(|addr| map.contains_key(&addr)) {
            return Err(AddressError::IllegalAddress { start, count });
        }
        for (addr, &value) in addresses.zip(values) {
            map.insert(addr, value);
        }
        Ok(())
    }

    /// Write a range of collaborator-facing values; each value must match the space type.
    pub fn write_range(
        &self,
        space: RegisterSpace,
        start: u16,
        values: &[RegisterValue],
    ) -> Result<(), AddressError> {
        if space.is_bit_space() {
            let bits = values
                .iter()
                .map(|value| match value {
                    RegisterValue::Bit(bit) => Ok(*bit),
                    RegisterValue::Word(_) => Err(WRONG_SPACE_TYPE),
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.write_bits(space, start, &bits)
        } else {
            let words = values
                .iter()
                .map(|value| match value {
                    RegisterValue::Word(word) => Ok(*word),
                    RegisterValue::Bit(_) => Err(WRONG_SPACE_TYPE),
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.write_words(space, start, &words)
        }
    }

    /// Set a single address, creating it if absent. This is how collaborators
    /// populate and update the simulated device at runtime.
    pub fn set_value(
        &self,
        space: RegisterSpace,
        address: u16,
        value: RegisterValue,
    ) -> Result<(), AddressError> {
        let mut data = self.write_guard();
        match value {
            RegisterValue::Bit(bit) => {
                data.bits_mut(space)?.insert(address, bit);
            }
            RegisterValue::Word(word) => {
                data.words_mut(space)?.insert(address, word);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // File records
    // ------------------------------------------------------------------

    /// Read exactly `word_count * 2` bytes of a stored record.
    ///
    /// Longer records are truncated; shorter ones fail with [`FileError::RecordTooShort`].
    pub fn read_file_record(
        &self,
        file_number: u16,
        record_number: u16,
        word_count: u16,
    ) -> Result<Bytes, FileError> {
        let data = self.read_guard();
        let records = data
            .file_records
            .get(&file_number)
            .ok_or(FileError::UnknownFile { file_number })?;
        let record = records
            .get(&record_number)
            .ok_or(FileError::UnknownRecord {
                file_number,
                record_number,
            })?;
        let requested = word_count as usize * 2;
        if record.len() < requested {
            return Err(FileError::RecordTooShort {
                available: record.len(),
                requested,
            });
        }
        Ok(record.slice(..requested))
    }

    /// Store a file record, replacing any previous content
    pub fn set_file_record(&self, file_number: u16, record_number: u16, content: Bytes) {
        self.write_guard()
            .file_records
            .entry(file_number)
            .or_default()
            .insert(record_number, content);
    }

    // ------------------------------------------------------------------
    // Whole-store access
    // ------------------------------------------------------------------

    /// Consistent copy of the whole store, taken under a single lock acquisition
    pub fn copy_data(&self) -> RegisterData {
        self.read_guard().clone()
    }

    /// Number of populated addresses per space
    pub fn counts(&self) -> RegisterCounts {
        let data = self.read_guard();
        RegisterCounts {
            coils: data.coils.len(),
            discrete_inputs: data.discrete_inputs.len(),
            holding_registers: data.holding_registers.len(),
            input_registers: data.input_registers.len(),
            file_records: data.file_records.values().map(BTreeMap::len).sum(),
        }
    }
}

impl Default for RegisterStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Addresses `start..start + count`, failing if the range runs past 0xFFFF
fn address_range(
    start: u16,
    count: u16,
) -> Result<impl Iterator<Item = u16> + Clone, AddressError> {
    let end = start as u32 + count as u32;
    if end > u16::MAX as u32 + 1 {
        return Err(AddressError::IllegalAddress { start, count });
    }
    Ok((start as u32..end).map(|addr| addr as u16))
}

fn quantity(len: usize) -> Result<u16, AddressError> {
    u16::try_from(len).map_err(|_| AddressError::IllegalValue {
        reason: "quantity exceeds per-request maximum",
    })
}
