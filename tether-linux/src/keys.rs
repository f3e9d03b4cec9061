//! Persistent device identity: the X25519 secret, hex encoded, in the state directory.

use std::path::Path;

use anyhow::{bail, Context};
use tether_core::Keypair;
use tracing::info;

/// Load the keypair at `path`, or generate one and write it there.
pub fn load_or_create(path: &Path) -> anyhow::Result<Keypair> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("identity key is not hex")?;
        let Ok(secret) = <[u8; 32]>::try_from(bytes.as_slice()) else {
            bail!("identity key must be 32 bytes, got {}", bytes.len());
        };
        return Ok(Keypair::from_secret_bytes(secret));
    }
    let keypair = Keypair::generate();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    write_private(path, hex::encode(keypair.secret_bytes()).as_bytes())
        .with_context(|| format!("writing {}", path.display()))?;
    info!(device_id = %keypair.device_id(), path = %path.display(), "generated identity");
    Ok(keypair)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}
