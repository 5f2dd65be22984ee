//! Configuration module for oppnet
//!
//! JSON configuration for the daemon plus the named key/value parameters
//! the protocol layer accepts at runtime (`TCPServer.port` and friends).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::common::{Address, Interface, InterfaceId, InterfaceType};
use crate::envelope::MAX_HEADER_SIZE;
use crate::error::{Error, Result};

/// Default TCP port for peer connections
pub const TCP_DEFAULT_PORT: u16 = 9697;

/// Default listen backlog of the TCP server
pub const TCP_BACKLOG_SIZE: u32 = 30;

/// Default port of the local application endpoint
pub const LOCAL_DEFAULT_PORT: u16 = 8787;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Where received payloads are stored
    #[serde(default)]
    pub storage: StorageConfig,

    /// TCP server parameters
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Protocol instance lifecycle parameters
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Local interfaces announced at startup
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Example configuration with one wired interface and the local
    /// application endpoint
    pub fn sample() -> Self {
        Config {
            interfaces: vec![
                InterfaceConfig {
                    name: "eth0".to_string(),
                    kind: InterfaceType::WiredLan,
                    addresses: vec![Address::ip_port([192, 168, 1, 10].into(), 0)],
                    parent: None,
                },
                InterfaceConfig {
                    name: "app-local".to_string(),
                    kind: InterfaceType::ApplicationLocal,
                    addresses: vec![Address::ip_port([127, 0, 0, 1].into(), LOCAL_DEFAULT_PORT)],
                    parent: None,
                },
            ],
            ..Default::default()
        }
    }

    /// Apply one named parameter
    ///
    /// Invalid values are rejected and leave the previous value in place.
    pub fn apply_parameter(&mut self, key: &str, value: &str) -> Result<()> {
        let invalid = || Error::Config(format!("Invalid value '{}' for {}", value, key));
        let value = value.trim();

        match key {
            "TCPServer.port" => {
                self.tcp.port = value.parse().map_err(|_| invalid())?;
                info!("Setting TCP server port to {}", self.tcp.port);
            }
            "TCPServer.backlog" => {
                let backlog: u32 = value.parse().map_err(|_| invalid())?;
                if backlog == 0 {
                    return Err(invalid());
                }
                self.tcp.backlog = backlog;
                info!("Setting TCP backlog to {}", backlog);
            }
            "Protocol.shutdown_timeout_ms" => {
                self.protocol.shutdown_timeout_ms = value.parse().map_err(|_| invalid())?;
                info!(
                    "Setting protocol shutdown timeout to {} ms",
                    self.protocol.shutdown_timeout_ms
                );
            }
            "Protocol.idle_timeout_secs" => {
                let secs: u64 = value.parse().map_err(|_| invalid())?;
                if secs == 0 {
                    return Err(invalid());
                }
                self.protocol.idle_timeout_secs = secs;
                info!("Setting sender idle timeout to {} s", secs);
            }
            _ => return Err(Error::Config(format!("Unknown parameter {}", key))),
        }
        Ok(())
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Payload storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for received payload files
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("oppnet-data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// TCP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_tcp_port")]
    pub port: u16,

    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Port of the application endpoint on loopback
    #[serde(default = "default_local_port")]
    pub local_port: u16,
}

fn default_tcp_port() -> u16 {
    TCP_DEFAULT_PORT
}

fn default_backlog() -> u32 {
    TCP_BACKLOG_SIZE
}

fn default_local_port() -> u16 {
    LOCAL_DEFAULT_PORT
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            port: default_tcp_port(),
            backlog: default_backlog(),
            local_port: default_local_port(),
        }
    }
}

/// Protocol lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Grace period before remaining instances are forcibly detached
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Idle time after which a sender closes its connection
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Upper bound on a received header
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
}

fn default_shutdown_timeout_ms() -> u64 {
    15_000
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_header_size() -> usize {
    MAX_HEADER_SIZE
}

impl ProtocolConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_header_size: default_max_header_size(),
        }
    }
}

/// A local interface announced at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: InterfaceType,

    #[serde(default)]
    pub addresses: Vec<Address>,

    /// Interface this one is reached through, if any
    #[serde(default)]
    pub parent: Option<String>,
}

impl InterfaceConfig {
    /// Build the local interface descriptor
    pub fn to_interface(&self) -> Interface {
        let mut iface = Interface::new(self.name.clone(), self.kind).local();
        iface.addresses = self.addresses.clone();
        iface
    }

    pub fn parent_id(&self) -> Option<InterfaceId> {
        self.parent.as_ref().map(InterfaceId::new)
    }
}
