use crate::{QuickshareError, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_ANNOUNCE_INTERVAL_MS: u64 = 60 * 60 * 1000;
const MAX_EVICTION_MULTIPLIER: u32 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub device: DeviceSettings,
    pub network: NetworkSettings,
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub bind_address: IpAddr,
    /// 0 binds an ephemeral port; the bound port is what gets announced.
    pub control_port: u16,
    pub discovery_port: u16,
    pub announce_target: IpAddr,
    pub announce_interval_ms: u64,
    pub eviction_multiplier: u32,
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub receive_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device: DeviceSettings {
                name: gethostname::gethostname().to_string_lossy().to_string(),
            },
            network: NetworkSettings {
                bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                control_port: 60000,
                discovery_port: 37020,
                announce_target: IpAddr::V4(Ipv4Addr::BROADCAST),
                announce_interval_ms: 1000,
                eviction_multiplier: 3,
                handshake_timeout_secs: 10,
            },
            transfer: TransferSettings {
                chunk_size: 1024 * 1024, // 1MB chunks
                receive_dir: None,
            },
        }
    }
}

impl Settings {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = match config_path {
            Some(path) => PathBuf::from(path),
            None => Self::default_config_path()?,
        };

        let settings = if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| QuickshareError::Config(format!("Failed to read config: {}", e)))?;

            toml::from_str::<Settings>(&content)
                .map_err(|e| QuickshareError::Config(format!("Failed to parse config: {}", e)))?
        } else {
            let settings = Self::default();
            settings.save(Some(&path))?;
            settings
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let path = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                QuickshareError::Config(format!("Failed to create config dir: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| QuickshareError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(&path, content)
            .map_err(|e| QuickshareError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(QuickshareError::Config(
                "transfer.chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.network.announce_interval_ms == 0 {
            return Err(QuickshareError::Config(
                "network.announce_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.network.announce_interval_ms > MAX_ANNOUNCE_INTERVAL_MS {
            return Err(QuickshareError::Config(format!(
                "network.announce_interval_ms must be at most {}",
                MAX_ANNOUNCE_INTERVAL_MS
            )));
        }
        if self.network.eviction_multiplier == 0
            || self.network.eviction_multiplier > MAX_EVICTION_MULTIPLIER
        {
            return Err(QuickshareError::Config(format!(
                "network.eviction_multiplier must be between 1 and {}",
                MAX_EVICTION_MULTIPLIER
            )));
        }
        Ok(())
    }

    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "quickshare", "daemon").ok_or_else(|| {
            QuickshareError::Config("Failed to get project directories".to_string())
        })?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.network.announce_interval_ms)
    }

    /// Peers silent for longer than this drop out of the peer table.
    pub fn eviction_window(&self) -> Duration {
        self.announce_interval()
            .saturating_mul(self.network.eviction_multiplier)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.network.handshake_timeout_secs)
    }

    pub fn control_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.network.bind_address, self.network.control_port)
    }

    pub fn discovery_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.network.bind_address, self.network.discovery_port)
    }

    pub fn announce_target_addr(&self) -> SocketAddr {
        SocketAddr::new(self.network.announce_target, self.network.discovery_port)
    }

    pub fn receive_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.transfer.receive_dir {
            return dir.clone();
        }
        UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("received"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_writes_defaults_when_missing() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let settings = Settings::load(path.to_str()).unwrap();
        assert!(path.exists());
        assert_eq!(settings.network.discovery_port, 37020);
        assert_eq!(settings.transfer.chunk_size, 1024 * 1024);
    }

    #[test]
    fn test_save_then_load_keeps_values() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut settings = Settings::default();
        settings.device.name = "bench-node".to_string();
        settings.network.control_port = 0;
        settings.transfer.receive_dir = Some(temp_dir.path().join("inbox"));
        settings.save(Some(&path)).unwrap();

        let loaded = Settings::load(path.to_str()).unwrap();
        assert_eq!(loaded.device.name, "bench-node");
        assert_eq!(loaded.network.control_port, 0);
        assert_eq!(loaded.receive_dir(), temp_dir.path().join("inbox"));
    }

    #[test]
    fn test_eviction_window_is_multiple_of_interval() {
        let settings = Settings::default();
        assert_eq!(settings.eviction_window(), Duration::from_secs(3));
    }

    #[test]
    fn test_oversized_timing_rejected_and_window_saturates() {
        let mut settings = Settings::default();
        settings.network.announce_interval_ms = u64::MAX;
        settings.network.eviction_multiplier = u32::MAX;
        assert_eq!(settings.eviction_window(), Duration::MAX);
        assert!(matches!(
            settings.validate(),
            Err(QuickshareError::Config(_))
        ));

        settings.network.announce_interval_ms = 1000;
        assert!(matches!(
            settings.validate(),
            Err(QuickshareError::Config(_))
        ));

        settings.network.eviction_multiplier = 3;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut settings = Settings::default();
        settings.transfer.chunk_size = 0;
        settings.save(Some(&path)).unwrap();

        assert!(matches!(
            Settings::load(path.to_str()),
            Err(QuickshareError::Config(_))
        ));
    }
}
