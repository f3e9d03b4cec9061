//! Settings the core needs from its embedder.

use std::path::PathBuf;
use std::time::Duration;

use crate::device::DeviceType;
use crate::pairing::DEFAULT_PAIRING_TIMEOUT;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Name announced in our identity packet.
    pub device_name: String,
    pub device_type: DeviceType,
    /// How long an outstanding pairing request lives.
    pub pairing_timeout: Duration,
    /// Where payload-backed notification icons are cached, one file per payload hash.
    pub icon_cache_dir: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            device_name: "tether".into(),
            device_type: DeviceType::Desktop,
            pairing_timeout: DEFAULT_PAIRING_TIMEOUT,
            icon_cache_dir: default_icon_cache_dir(),
        }
    }
}

/// `$TMPDIR/tether_<user>`.
pub fn default_icon_cache_dir() -> PathBuf {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".into());
    std::env::temp_dir().join(format!("tether_{user}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = CoreConfig::default();
        assert_eq!(c.pairing_timeout, Duration::from_secs(30));
        assert_eq!(c.device_type, DeviceType::Desktop);
        assert!(c.icon_cache_dir.starts_with(std::env::temp_dir()));
        let name = c.icon_cache_dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tether_"));
    }
}
