//! Payload fetches deduplicated by destination path.
//!
//! Several packets can reference the same bulk data (the same icon hash, for example). Only
//! the first fetch for a destination reads its payload; later callers attach to it and receive
//! the same outcome. Nothing is retried: a failed fetch reports to every waiter, removes the
//! partial file, and the next call starts fresh.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::packet::{Payload, PayloadReader};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("i/o error: {0}")]
    Io(String),
    #[error("size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch { expected: u64, got: u64 },
    #[error("payload source closed")]
    SourceClosed,
    #[error("payload already consumed")]
    AlreadyConsumed,
    #[error("link error: {0}")]
    Link(String),
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::Io(e.to_string())
    }
}

type Outcome = Option<Result<PathBuf, TransferError>>;
type InFlight = HashMap<PathBuf, watch::Sender<Outcome>>;

/// Shared handle; clones see the same in-flight table.
#[derive(Clone, Default)]
pub struct TransferCoordinator {
    in_flight: Arc<Mutex<InFlight>>,
}

impl TransferCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(map: &Mutex<InFlight>) -> MutexGuard<'_, InFlight> {
        map.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `destination` hold the payload's bytes.
    ///
    /// Returns immediately if the file already exists. If a fetch for the same destination
    /// is running, waits for it and leaves `payload` untouched.
    pub async fn fetch(
        &self,
        destination: impl AsRef<Path>,
        payload: Arc<Payload>,
    ) -> Result<PathBuf, TransferError> {
        let destination = destination.as_ref().to_path_buf();
        if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
            return Ok(destination);
        }
        let mut rx = {
            let mut in_flight = Self::lock(&self.in_flight);
            match in_flight.get(&destination) {
                Some(tx) => {
                    debug!(path = %destination.display(), "joining in-flight transfer");
                    tx.subscribe()
                }
                None => {
                    // A drain that finished since the check above renamed before removing its entry.
                    if destination.exists() {
                        return Ok(destination);
                    }
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(destination.clone(), tx);
                    self.spawn_drain(destination.clone(), payload);
                    rx
                }
            }
        };
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TransferError::Io("transfer task ended without a result".into()))?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(TransferError::Io("transfer finished without a result".into())),
        }
    }

    fn spawn_drain(&self, destination: PathBuf, payload: Arc<Payload>) {
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            debug!(path = %destination.display(), size = ?payload.size(), "transfer started");
            let result = drain(&destination, &payload)
                .await
                .map(|()| destination.clone());
            if let Err(e) = &result {
                warn!(path = %destination.display(), error = %e, "transfer failed");
            }
            let mut in_flight = Self::lock(&in_flight);
            if let Some(tx) = in_flight.remove(&destination) {
                tx.send_replace(Some(result));
            }
        });
    }

    pub fn in_flight_count(&self) -> usize {
        Self::lock(&self.in_flight).len()
    }

    pub fn is_in_flight(&self, destination: impl AsRef<Path>) -> bool {
        Self::lock(&self.in_flight).contains_key(destination.as_ref())
    }
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn drain(destination: &Path, payload: &Payload) -> Result<(), TransferError> {
    let mut reader = payload.open().await?;
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = part_path(destination);
    let result = write_part(&part, &mut reader, payload).await;
    let result = match result {
        Ok(()) => tokio::fs::rename(&part, destination)
            .await
            .map_err(TransferError::from),
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&part).await;
    }
    result
}

async fn write_part(
    part: &Path,
    reader: &mut PayloadReader,
    payload: &Payload,
) -> Result<(), TransferError> {
    let mut file = tokio::fs::File::create(part).await?;
    let copied = tokio::select! {
        _ = payload.source_closed().cancelled() => return Err(TransferError::SourceClosed),
        copied = tokio::io::copy(reader, &mut file) => copied?,
    };
    file.flush().await?;
    match payload.size() {
        Some(expected) if copied != expected => Err(TransferError::SizeMismatch {
            expected,
            got: copied,
        }),
        _ => Ok(()),
    }
}
