//! Device identity and crypto: keypairs, device ID, fingerprints, session keys, wire encryption.

use std::fmt;
use std::str::FromStr;

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Device public key (32 bytes, X25519). This is the opaque identity credential of a peer.
/// Serialized as lowercase hex.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    /// SHA-256 of the key as colon-separated uppercase hex, the form users compare by eye.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        digest
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for PublicKey {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PublicKey(decode_hex_array(s)?))
    }
}

impl TryFrom<String> for PublicKey {
    type Error = IdentityParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PublicKey> for String {
    fn from(k: PublicKey) -> Self {
        k.to_string()
    }
}

/// Device ID: deterministic hash of public key. Stable for as long as the peer keeps its key.
/// Displayed and serialized as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(pub [u8; 16]);

impl DeviceId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Derive device ID from a public key (same as Keypair does).
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        DeviceId(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for DeviceId {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DeviceId(decode_hex_array(s)?))
    }
}

impl TryFrom<String> for DeviceId {
    type Error = IdentityParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

fn decode_hex_array<const N: usize>(s: &str) -> Result<[u8; N], IdentityParseError> {
    let bytes = hex::decode(s).map_err(|_| IdentityParseError::NotHex(s.to_string()))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| IdentityParseError::Length { expected: N, got: len })
}

/// Error parsing a hex-encoded device ID or public key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityParseError {
    #[error("not a hex string: {0}")]
    NotHex(String),
    #[error("expected {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
}

/// X25519 keypair. Keep secret key private; expose only public key and device ID.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    device_id: DeviceId,
}

impl Keypair {
    /// Generate a new random keypair and derive device ID from public key.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Restore a keypair from its 32 secret bytes (as written by `secret_bytes`).
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public_x = X25519PublicKey::from(&secret);
        let public = PublicKey(public_x.to_bytes());
        let device_id = DeviceId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            device_id,
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Shared secret with another device's public key. Used to derive session key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Derive a 32-byte session key from shared secret (for ChaCha20-Poly1305).
/// Pairwise: each pair of devices has its own session key.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"tether-session-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Derive a one-off key for a payload stream, so payload chunks never share nonces with
/// the packet stream.
pub fn derive_payload_key(session_key: &[u8; 32], packet_id: i64, port: u16) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"tether-payload-v1");
    hasher.update(session_key);
    hasher.update(packet_id.to_le_bytes());
    hasher.update(port.to_le_bytes());
    hasher.finalize().into()
}

/// Wire encryption: ChaCha20-Poly1305. Nonce: 96-bit counter per direction; never reuse.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_bytes(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Wire decryption.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_bytes(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

fn nonce_bytes(nonce: u64) -> [u8; 12] {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&nonce.to_le_bytes());
    nonce_bytes
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
