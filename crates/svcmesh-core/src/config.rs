//! Configuration for svcmesh handles.
//!
//! Wire constants live in [`ProtocolConfig`]. Everything a handle can tune is
//! passed explicitly at construction through [`ClientConfig`] or
//! [`ServerConfig`]; there is no process-wide mutable state.

use crate::{Result, ServiceError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wire protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const HEADER_MAGIC: [u8; 4] = *b"SVCM";
    /// Size of the header fields this implementation knows about.
    pub const HEADER_LEN: usize = 20;
    /// Bytes needed before `header_length` can be read.
    pub const HEADER_PREFIX_LEN: usize = 8;
    pub const MIN_SUPPORTED_VERSION: u8 = 1;
    pub const MAX_SUPPORTED_VERSION: u8 = 1;
    /// Handshake response value meaning "no common version".
    pub const VERSION_REJECTED: u8 = 0;
    pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024; // 64MB
}

/// Configuration for a [`ServiceClient`](crate::ServiceClient) and its sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub min_protocol_version: u8,
    pub max_protocol_version: u8,
    /// Upper bound for resolve + TCP connect.
    pub connect_timeout_ms: u64,
    /// Timeout used by calls that pass `None`; `None` here means infinite.
    pub default_call_timeout_ms: Option<u64>,
    pub max_payload_size: usize,
    pub tcp_nodelay: bool,
    /// Only address endpoints on this host. Empty or `None` broadcasts.
    pub host_filter: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            min_protocol_version: ProtocolConfig::MIN_SUPPORTED_VERSION,
            max_protocol_version: ProtocolConfig::MAX_SUPPORTED_VERSION,
            connect_timeout_ms: 5_000,
            default_call_timeout_ms: None,
            max_payload_size: ProtocolConfig::DEFAULT_MAX_PAYLOAD_SIZE,
            tcp_nodelay: true,
            host_filter: None,
        }
    }
}

impl ClientConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_host_filter(mut self, host: impl Into<String>) -> Self {
        self.host_filter = Some(host.into());
        self
    }

    pub fn with_protocol_versions(mut self, min: u8, max: u8) -> Self {
        self.min_protocol_version = min;
        self.max_protocol_version = max;
        self
    }

    pub fn with_default_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_call_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn default_call_timeout(&self) -> Option<Duration> {
        self.default_call_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        validate_versions(self.min_protocol_version, self.max_protocol_version)?;
        if self.connect_timeout_ms == 0 {
            return Err(ServiceError::Config {
                message: "connect_timeout_ms must be greater than zero".to_string(),
            });
        }
        validate_payload_size(self.max_payload_size)
    }
}

/// Configuration for a [`ServiceServer`](crate::ServiceServer) and its listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// 0 lets the OS assign a port.
    pub port: u16,
    /// Address announced to clients. Defaults to the bind address, or the
    /// local host name when bound to an unspecified address.
    pub advertised_address: Option<String>,
    pub min_protocol_version: u8,
    pub max_protocol_version: u8,
    pub max_connections: usize,
    /// Applies to requests read and responses written.
    pub max_payload_size: usize,
    pub tcp_nodelay: bool,
    /// How long an accepted connection may take to send its handshake.
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            advertised_address: None,
            min_protocol_version: ProtocolConfig::MIN_SUPPORTED_VERSION,
            max_protocol_version: ProtocolConfig::MAX_SUPPORTED_VERSION,
            max_connections: 256,
            max_payload_size: ProtocolConfig::DEFAULT_MAX_PAYLOAD_SIZE,
            tcp_nodelay: true,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_protocol_versions(mut self, min: u8, max: u8) -> Self {
        self.min_protocol_version = min;
        self.max_protocol_version = max;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        validate_versions(self.min_protocol_version, self.max_protocol_version)?;
        if self.max_connections == 0 {
            return Err(ServiceError::Config {
                message: "max_connections must be greater than zero".to_string(),
            });
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ServiceError::Config {
                message: "handshake_timeout_ms must be greater than zero".to_string(),
            });
        }
        validate_payload_size(self.max_payload_size)
    }
}

fn validate_versions(min: u8, max: u8) -> Result<()> {
    if min == ProtocolConfig::VERSION_REJECTED {
        return Err(ServiceError::Config {
            message: "protocol version 0 is reserved".to_string(),
        });
    }
    if min > max {
        return Err(ServiceError::Config {
            message: format!("protocol version range [{}, {}] is empty", min, max),
        });
    }
    Ok(())
}

fn validate_payload_size(size: usize) -> Result<()> {
    if size == 0 || size > u32::MAX as usize {
        return Err(ServiceError::Config {
            message: format!("max_payload_size {} is out of range", size),
        });
    }
    Ok(())
}
