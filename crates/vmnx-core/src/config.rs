//! Engine configuration (§6, §10).
//!
//! Resolution order: environment variables → config file → built-in defaults.
//!
//! Config file location:
//!   1. $VMNX_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/vmnx/config.toml
//!   3. ~/.config/vmnx/config.toml

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Engine-wide tunables (§6 external interface options).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// TCP control-channel port.
    pub tcp_port: u16,
    /// UDP media/bulk-channel port.
    pub udp_port: u16,
    /// WebSocket control-channel port (alternate transport, same framing).
    pub ws_port: u16,
    /// Address the server binds to / the client connects to.
    pub server_ip: IpAddr,
    /// Request→response correlation timeout, in milliseconds (§4.A).
    pub message_timeout_ms: u64,
    /// Reassembly cap for a single UDP-carried message, in bytes (§4.B).
    pub max_udp_message_size: usize,
    /// Target UDP datagram size, in bytes; payload budget is this minus the
    /// 52-byte header (§4.B).
    pub datagram_size: usize,
    /// Number of packets sent under one UDP AEAD key before the server
    /// triggers a rekey (§4.C).
    pub rekey_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tcp_port: 5000,
            udp_port: 5002,
            ws_port: 5001,
            server_ip: IpAddr::from([0, 0, 0, 0]),
            message_timeout_ms: 180_000,
            max_udp_message_size: crate::wire::DEFAULT_MAX_UDP_MESSAGE_SIZE,
            datagram_size: crate::wire::DEFAULT_DATAGRAM_MTU,
            rekey_threshold: 1_000_000,
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("vmnx")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

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
}

impl EngineConfig {
    /// Load configuration: file (if present) → `VMNX_*` env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            EngineConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path: `$VMNX_CONFIG`, else `$XDG_CONFIG_HOME/vmnx/config.toml`,
    /// else `~/.config/vmnx/config.toml`.
    pub fn file_path() -> PathBuf {
        std::env::var("VMNX_CONFIG")
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
            let text = toml::to_string_pretty(&EngineConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply `VMNX_*` env var overrides on top of whatever was loaded from
    /// file or defaults.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VMNX_TCP_PORT") {
            if let Ok(p) = v.parse() {
                self.tcp_port = p;
            }
        }
        if let Ok(v) = std::env::var("VMNX_UDP_PORT") {
            if let Ok(p) = v.parse() {
                self.udp_port = p;
            }
        }
        if let Ok(v) = std::env::var("VMNX_WS_PORT") {
            if let Ok(p) = v.parse() {
                self.ws_port = p;
            }
        }
        if let Ok(v) = std::env::var("VMNX_SERVER_IP") {
            if let Ok(ip) = v.parse() {
                self.server_ip = ip;
            }
        }
        if let Ok(v) = std::env::var("VMNX_MESSAGE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.message_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("VMNX_MAX_UDP_MESSAGE_SIZE") {
            if let Ok(n) = v.parse() {
                self.max_udp_message_size = n;
            }
        }
        if let Ok(v) = std::env::var("VMNX_DATAGRAM_SIZE") {
            if let Ok(n) = v.parse() {
                self.datagram_size = n;
            }
        }
        if let Ok(v) = std::env::var("VMNX_REKEY_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.rekey_threshold = n;
            }
        }
    }
}
