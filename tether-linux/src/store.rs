//! Trusted devices on disk: one TOML file with a `[[device]]` table per record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tether_core::{DeviceId, DeviceRecord, StoreError, TrustStore};
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustFile {
    #[serde(default)]
    device: Vec<DeviceRecord>,
}

/// File-backed [`TrustStore`]. The whole file is rewritten on every change; writes go to a
/// sibling temp file first and are renamed into place.
pub struct FileTrustStore {
    path: PathBuf,
    records: Mutex<BTreeMap<DeviceId, DeviceRecord>>,
}

impl FileTrustStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str::<TrustFile>(&text)
                .map_err(|e| StoreError::Deserialize(e.to_string()))?
                .device
                .into_iter()
                .map(|r| (r.id, r))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &BTreeMap<DeviceId, DeviceRecord>) -> Result<(), StoreError> {
        let file = TrustFile {
            device: records.values().cloned().collect(),
        };
        let text = toml::to_string_pretty(&file).map_err(|e| StoreError::Serialize(e.to_string()))?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), devices = records.len(), "trust store written");
        Ok(())
    }
}

impl TrustStore for FileTrustStore {
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
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(record.id, record.clone());
        self.persist(&records)
    }

    fn remove(&self, id: &DeviceId) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.remove(id).is_none() {
            return Ok(());
        }
        self.persist(&records)
    }
}
