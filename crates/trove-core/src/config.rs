//! Configuration system for trove peers.
//!
//! Resolution order: positional arguments → environment variables → config
//! file → defaults.
//!
//! Config file location:
//!   1. $TROVE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/trove/config.toml
//!   3. ~/.config/trove/config.toml

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunk::PeerId;
use crate::wire::Dialect;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TroveConfig {
    pub peer: PeerConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Numeric ID carried in every message header. Must be unique on the segment.
    pub id: PeerId,
    pub dialect: Dialect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Control channel group (DELETE, STORED, GETCHUNK, REMOVED, STARTUP, DELETED).
    pub control: SocketAddr,
    /// Backup-data channel group (PUTCHUNK).
    pub backup: SocketAddr,
    /// Restore-data channel group (CHUNK).
    pub restore: SocketAddr,
    /// Local control endpoint. A bare port binds on 127.0.0.1.
    pub access_point: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Each peer keeps its chunks and state under `<root>/peer-<id>`.
    pub root: PathBuf,
    /// Storage cap for a peer with no persisted state.
    pub max_bytes: u64,
}

/// Protocol timing. Durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub backup_tries: u32,
    pub backup_initial_delay_ms: u64,
    pub delete_tries: u32,
    pub delete_interval_ms: u64,
    /// Upper bound (exclusive) of the random delay before any response.
    pub response_jitter_ms: u64,
    /// Accept/connect timeout of an enhanced direct chunk transfer.
    pub transfer_timeout_ms: u64,
    pub persist_interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TroveConfig {
    fn default() -> Self {
        Self {
            peer: PeerConfig::default(),
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            id: 1,
            dialect: Dialect::Baseline,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            control: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(230, 0, 0, 1)), 4445),
            backup: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(230, 0, 0, 2)), 4446),
            restore: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(230, 0, 0, 3)), 4447),
            access_point: "7470".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: data_dir(),
            max_bytes: 2_147_483_647,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            backup_tries: 5,
            backup_initial_delay_ms: 1000,
            delete_tries: 3,
            delete_interval_ms: 1000,
            response_jitter_ms: 400,
            transfer_timeout_ms: 1000,
            persist_interval_ms: 2000,
        }
    }
}

impl ProtocolConfig {
    pub fn backup_initial_delay(&self) -> Duration {
        Duration::from_millis(self.backup_initial_delay_ms)
    }

    pub fn delete_interval(&self) -> Duration {
        Duration::from_millis(self.delete_interval_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }
}

impl StorageConfig {
    pub fn peer_dir(&self, id: PeerId) -> PathBuf {
        self.root.join(format!("peer-{id}"))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("trove")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("trove")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid dialect {0:?}, expected 1.0 or 2.0")]
    InvalidDialect(String),
    #[error("invalid {0}: {1:?}")]
    InvalidValue(&'static str, String),
    #[error("expected 9 startup arguments, got {0}")]
    WrongArgumentCount(usize),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TroveConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TroveConfig::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TROVE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TroveConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TROVE_* env var overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("TROVE_PEER__ID") {
            self.peer.id = parse_field("peer id", &v)?;
        }
        if let Ok(v) = std::env::var("TROVE_PEER__DIALECT") {
            self.peer.dialect = parse_dialect(&v)?;
        }
        if let Ok(v) = std::env::var("TROVE_NETWORK__ACCESS_POINT") {
            self.network.access_point = v;
        }
        if let Ok(v) = std::env::var("TROVE_STORAGE__ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        Ok(())
    }

    /// Apply the positional startup arguments:
    /// `<dialect> <peer_id> <access_point> <mc_addr> <mc_port> <mdb_addr> <mdb_port> <mdr_addr> <mdr_port>`.
    pub fn apply_args(&mut self, args: &[String]) -> Result<(), ConfigError> {
        let [dialect, id, access_point, mc_addr, mc_port, mdb_addr, mdb_port, mdr_addr, mdr_port] =
            args
        else {
            return Err(ConfigError::WrongArgumentCount(args.len()));
        };

        self.peer.dialect = parse_dialect(dialect)?;
        self.peer.id = parse_field("peer id", id)?;
        parse_access_point(access_point)?;
        self.network.access_point = access_point.clone();
        self.network.control = group_addr("control channel", mc_addr, mc_port)?;
        self.network.backup = group_addr("backup channel", mdb_addr, mdb_port)?;
        self.network.restore = group_addr("restore channel", mdr_addr, mdr_port)?;
        Ok(())
    }

    /// Resolved control endpoint address.
    pub fn access_point(&self) -> Result<SocketAddr, ConfigError> {
        parse_access_point(&self.network.access_point)
    }
}

fn parse_dialect(v: &str) -> Result<Dialect, ConfigError> {
    v.parse()
        .map_err(|_| ConfigError::InvalidDialect(v.to_string()))
}

fn parse_field<T: std::str::FromStr>(name: &'static str, v: &str) -> Result<T, ConfigError> {
    v.parse()
        .map_err(|_| ConfigError::InvalidValue(name, v.to_string()))
}

fn group_addr(name: &'static str, addr: &str, port: &str) -> Result<SocketAddr, ConfigError> {
    let ip: IpAddr = parse_field(name, addr)?;
    let port: u16 = parse_field(name, port)?;
    Ok(SocketAddr::new(ip, port))
}

/// An access point is a bare port (bound on 127.0.0.1) or `ip:port`.
pub fn parse_access_point(v: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(port) = v.parse::<u16>() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    parse_field("access point", v)
}
