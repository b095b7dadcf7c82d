//! Centralized configuration for Shoal.
//!
//! All tunable parameters are defined here as explicit struct fields with
//! defaults, env overrides, and validated file loading. There is no dynamic
//! option lookup; an unrecognized or out-of-range value is a load error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid config value: {reason}")]
    Invalid { reason: String },
}

/// Central configuration for all Shoal components.
///
/// Groups related settings into logical sections. Supports environment
/// variable overrides and a JSON config file merged over the defaults.
#[derive(Debug, Clone, Default)]
pub struct ShoalConfig {
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub storage: StorageConfig,
    pub download: DownloadConfig,
}

/// Peer-to-peer transfer and connection pool configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP port the chunk server listens on
    pub peer_port: u16,
    /// Maximum connections held by the pool
    pub max_connections: usize,
    /// Idle time after which a pooled connection is evicted
    pub connection_timeout: Duration,
    /// Timeout for establishing an outbound connection
    pub connect_timeout: Duration,
    /// Timeout for a single read or write during an exchange
    pub exchange_timeout: Duration,
    /// Server-side idle timeout for an accepted connection
    pub idle_client_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            peer_port: 5000,
            max_connections: 10,
            connection_timeout: Duration::from_secs(300), // 5 minutes
            connect_timeout: Duration::from_secs(10),
            exchange_timeout: Duration::from_secs(10),
            idle_client_timeout: Duration::from_secs(30),
        }
    }
}

/// Announcement broadcast and peer directory configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port the listener binds to
    pub broadcast_port: u16,
    /// Ports each announcement batch is sent to
    pub target_ports: Vec<u16>,
    /// Delay between announcement cycles
    pub announce_interval: Duration,
    /// Inactivity timeout after which a peer is considered stale
    pub peer_timeout: Duration,
    /// How often the stale-peer and idle-connection reapers wake
    pub reap_interval: Duration,
    /// Maximum chunk entries per announcement datagram
    pub max_batch_entries: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_port: 5001,
            target_ports: vec![5001, 5002],
            announce_interval: Duration::from_secs(10),
            peer_timeout: Duration::from_secs(300), // 5 minutes
            reap_interval: Duration::from_secs(60),
            max_batch_entries: 8,
        }
    }
}

/// Chunk storage and file layout configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Bytes per chunk when splitting a file
    pub chunk_size: usize,
    /// Directory holding locally stored chunk files
    pub chunk_dir: PathBuf,
    /// Directory reassembled downloads are written to
    pub downloads_dir: PathBuf,
    /// Path of the persisted content directory
    pub content_dict_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100 * 1024, // 100 KiB
            chunk_dir: PathBuf::from("./chunks"),
            downloads_dir: PathBuf::from("./downloads"),
            content_dict_path: PathBuf::from("./content_dict.json"),
        }
    }
}

impl StorageConfig {
    /// Creates the chunk and downloads directories if missing.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.chunk_dir)?;
        std::fs::create_dir_all(&self.downloads_dir)?;
        Ok(())
    }
}

/// Download coordinator configuration.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Overall deadline for one download job
    pub overall_timeout: Duration,
    /// Upper bound on concurrent download workers
    pub max_workers: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            overall_timeout: Duration::from_secs(300), // 5 minutes
            max_workers: 5,
        }
    }
}

/// On-disk config file shape (`peer_config.json`).
///
/// Every field is optional; present fields override the defaults.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(rename = "CHUNK_SIZE")]
    chunk_size: Option<usize>,
    #[serde(rename = "BROADCAST_PORT")]
    broadcast_port: Option<u16>,
    #[serde(rename = "PEER_PORT")]
    peer_port: Option<u16>,
    #[serde(rename = "TARGET_PORTS")]
    target_ports: Option<Vec<u16>>,
    #[serde(rename = "MAX_CONNECTIONS")]
    max_connections: Option<usize>,
    #[serde(rename = "CONNECTION_TIMEOUT")]
    connection_timeout_secs: Option<u64>,
    #[serde(rename = "ANNOUNCE_INTERVAL")]
    announce_interval_secs: Option<u64>,
    #[serde(rename = "PEER_TIMEOUT")]
    peer_timeout_secs: Option<u64>,
    #[serde(rename = "DOWNLOAD_TIMEOUT")]
    download_timeout_secs: Option<u64>,
    #[serde(rename = "CHUNK_DIR")]
    chunk_dir: Option<PathBuf>,
    #[serde(rename = "DOWNLOADS_DIR")]
    downloads_dir: Option<PathBuf>,
    #[serde(rename = "CONTENT_DICT")]
    content_dict_path: Option<PathBuf>,
}

impl ShoalConfig {
    /// Loads configuration from a JSON file merged over the defaults.
    ///
    /// A missing file yields the defaults; a present but malformed file or
    /// an out-of-range value is an error.
    ///
    /// # Errors
    /// - `ConfigError::Read` - File exists but could not be read
    /// - `ConfigError::Parse` - File is not valid JSON or has unknown keys
    /// - `ConfigError::Invalid` - A value fails validation
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let file: ConfigFile =
                serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            config.merge_file(file);
        }

        config.validate()?;
        Ok(config)
    }

    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("SHOAL_PEER_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.network.peer_port = port;
            }
        }

        if let Ok(port) = std::env::var("SHOAL_BROADCAST_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.discovery.broadcast_port = port;
            }
        }

        if let Ok(max) = std::env::var("SHOAL_MAX_CONNECTIONS") {
            if let Ok(count) = max.parse::<usize>() {
                config.network.max_connections = count;
            }
        }

        if let Ok(interval) = std::env::var("SHOAL_ANNOUNCE_INTERVAL") {
            if let Ok(seconds) = interval.parse::<u64>() {
                config.discovery.announce_interval = Duration::from_secs(seconds);
            }
        }

        if let Ok(dir) = std::env::var("SHOAL_CHUNK_DIR") {
            config.storage.chunk_dir = PathBuf::from(dir);
        }

        config
    }

    /// Offsets the well-known ports by a numeric peer id.
    ///
    /// Lets several peers share one host during development without port
    /// collisions.
    pub fn for_peer(mut self, peer_id: u16) -> Self {
        self.network.peer_port += peer_id;
        self.discovery.broadcast_port += peer_id;
        self
    }

    fn merge_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.chunk_size {
            self.storage.chunk_size = v;
        }
        if let Some(v) = file.broadcast_port {
            self.discovery.broadcast_port = v;
        }
        if let Some(v) = file.peer_port {
            self.network.peer_port = v;
        }
        if let Some(v) = file.target_ports {
            self.discovery.target_ports = v;
        }
        if let Some(v) = file.max_connections {
            self.network.max_connections = v;
        }
        if let Some(v) = file.connection_timeout_secs {
            self.network.connection_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.announce_interval_secs {
            self.discovery.announce_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.peer_timeout_secs {
            self.discovery.peer_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.download_timeout_secs {
            self.download.overall_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.chunk_dir {
            self.storage.chunk_dir = v;
        }
        if let Some(v) = file.downloads_dir {
            self.storage.downloads_dir = v;
        }
        if let Some(v) = file.content_dict_path {
            self.storage.content_dict_path = v;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                reason: "CHUNK_SIZE must be positive".to_string(),
            });
        }
        if self.network.max_connections == 0 {
            return Err(ConfigError::Invalid {
                reason: "MAX_CONNECTIONS must be positive".to_string(),
            });
        }
        if self.discovery.target_ports.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "TARGET_PORTS must name at least one port".to_string(),
            });
        }
        if self.download.max_workers == 0 {
            return Err(ConfigError::Invalid {
                reason: "download worker count must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = ShoalConfig::default();

        assert_eq!(config.network.peer_port, 5000);
        assert_eq!(config.network.max_connections, 10);
        assert_eq!(config.network.connection_timeout, Duration::from_secs(300));
        assert_eq!(config.discovery.broadcast_port, 5001);
        assert_eq!(config.discovery.target_ports, vec![5001, 5002]);
        assert_eq!(config.discovery.announce_interval, Duration::from_secs(10));
        assert_eq!(config.storage.chunk_size, 100 * 1024);
        assert_eq!(config.download.overall_timeout, Duration::from_secs(300));
        assert_eq!(config.download.max_workers, 5);
    }

    #[test]
    fn test_peer_id_port_offsets() {
        let config = ShoalConfig::default().for_peer(3);

        assert_eq!(config.network.peer_port, 5003);
        assert_eq!(config.discovery.broadcast_port, 5004);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ShoalConfig::load(&dir.path().join("absent.json")).unwrap();

        assert_eq!(config.network.peer_port, 5000);
    }

    #[test]
    fn test_load_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer_config.json");
        std::fs::write(
            &path,
            r#"{"CHUNK_SIZE": 4096, "PEER_PORT": 6000, "ANNOUNCE_INTERVAL": 2}"#,
        )
        .unwrap();

        let config = ShoalConfig::load(&path).unwrap();

        assert_eq!(config.storage.chunk_size, 4096);
        assert_eq!(config.network.peer_port, 6000);
        assert_eq!(config.discovery.announce_interval, Duration::from_secs(2));
        // Untouched options keep their defaults
        assert_eq!(config.network.max_connections, 10);
    }

    #[test]
    fn test_load_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer_config.json");
        std::fs::write(&path, r#"{"CHUNK_SIZX": 4096}"#).unwrap();

        assert!(matches!(
            ShoalConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_rejects_zero_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer_config.json");
        std::fs::write(&path, r#"{"CHUNK_SIZE": 0}"#).unwrap();

        assert!(matches!(
            ShoalConfig::load(&path),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("SHOAL_MAX_CONNECTIONS", "4");
            std::env::set_var("SHOAL_ANNOUNCE_INTERVAL", "30");
        }

        let config = ShoalConfig::from_env();

        assert_eq!(config.network.max_connections, 4);
        assert_eq!(config.discovery.announce_interval, Duration::from_secs(30));

        // Cleanup
        unsafe {
            std::env::remove_var("SHOAL_MAX_CONNECTIONS");
            std::env::remove_var("SHOAL_ANNOUNCE_INTERVAL");
        }
    }
}
