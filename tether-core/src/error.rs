//! Error types surfaced by devices and the core registry.

use thiserror::Error;

use crate::link::LinkError;
use crate::pairing::PairingError;
use crate::store::StoreError;
use crate::transfer::TransferError;

/// Errors that can occur in device and registry operations
#[derive(Debug, Error)]
pub enum Error {
    /// No active link to the device
    #[error("device is unreachable")]
    Unreachable,

    /// Packet dropped before dispatch because the device is not trusted
    #[error("device is not trusted")]
    Untrusted,

    /// Pairing request expired
    #[error("pairing timed out")]
    PairingTimeout,

    /// Pairing refused by either side
    #[error("pairing rejected")]
    PairingRejected,

    /// Payload fetch failed
    #[error("transfer failed: {0}")]
    TransferFailed(#[from] TransferError),

    /// The link named in the call is gone
    #[error("link closed")]
    LinkClosed,

    /// Transport send failed
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// A link presented a different credential than the one the device was trusted with
    #[error("credential does not match the trusted device")]
    CredentialMismatch,

    /// Identity packet missing or inconsistent
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Trust store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<PairingError> for Error {
    fn from(e: PairingError) -> Self {
        match e {
            PairingError::Timeout => Error::PairingTimeout,
            PairingError::Rejected => Error::PairingRejected,
        }
    }
}

/// Result type for device and registry operations
pub type Result<T> = std::result::Result<T, Error>;
