//! Persistence boundary for trusted devices.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::device::DeviceType;
use crate::identity::{DeviceId, PublicKey};

/// What survives a restart for a trusted device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: String,
    pub device_type: DeviceType,
    /// Credential the device was trusted with.
    pub public_key: PublicKey,
    #[serde(default)]
    pub disabled_plugins: BTreeSet<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("serialize error: {0}")]
    Serialize(String),
    #[error("deserialize error: {0}")]
    Deserialize(String),
}

/// Written on trust change, on rename of a trusted device and on plugin enable change.
pub trait TrustStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<DeviceRecord>, StoreError>;
    /// Insert or replace the record with the same id.
    fn save(&self, record: &DeviceRecord) -> Result<(), StoreError>;
    /// Removing an unknown id is not an error.
    fn remove(&self, id: &DeviceId) -> Result<(), StoreError>;
}

/// In-memory store, for tests and for embedders without persistence.
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    records: Mutex<BTreeMap<DeviceId, DeviceRecord>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        Self {
            records: Mutex::new(records.into_iter().map(|r| (r.id, r)).collect()),
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

impl TrustStore for MemoryTrustStore {
    fn load_all(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    fn save(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.id, record.clone());
        Ok(())
    }

    fn remove(&self, id: &DeviceId) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(())
    }
}
