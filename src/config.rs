//! # Configuration Management
//!
//! Centralized configuration for servers, client sessions and the framing layer.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`PEERLINK_*` variables)
//!
//! ## Notes
//! - `server.port = 0` lets the system pick a port; the IPv6 listener is then
//!   moved to the same port as the IPv4 one
//! - The frame length limit only applies to incoming frames; outgoing frames are
//!   limited by the 32-bit length prefix

use crate::discovery::ServiceType;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max accepted incoming payload (16 MB)
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Initial capacity of a connection's incoming buffer
pub const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Default advertised service type
pub const DEFAULT_SERVICE_TYPE: &str = "peerlink";

/// Default transport protocol label
pub const DEFAULT_TRANSPORT_PROTOCOL: &str = "tcp";

/// Main configuration structure holding every configurable setting
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Advertised / browsed service identity
    #[serde(default)]
    pub service: ServiceConfig,

    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Framing and stream configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `PEERLINK_*` overrides read through `lookup`
    fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(kind) = lookup("PEERLINK_SERVICE_TYPE") {
            self.service.service_type = kind;
        }

        if let Some(port) = lookup("PEERLINK_SERVER_PORT") {
            self.server.port = port.parse::<u16>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid PEERLINK_SERVER_PORT: {port}"))
            })?;
        }

        if let Some(enable) = lookup("PEERLINK_ENABLE_IPV6") {
            if let Ok(val) = enable.parse::<bool>() {
                self.server.enable_ipv6 = val;
            }
        }

        if let Some(max) = lookup("PEERLINK_MAX_CONNECTIONS") {
            if let Ok(val) = max.parse::<usize>() {
                self.server.max_connections = val;
            }
        }

        if let Some(addr) = lookup("PEERLINK_CLIENT_ADDRESS") {
            self.client.address = Some(addr);
        }

        if let Some(max) = lookup("PEERLINK_MAX_FRAME_LENGTH") {
            if let Ok(val) = max.parse::<usize>() {
                self.transport.max_frame_length = val;
            }
        }

        if let Some(flush) = lookup("PEERLINK_FLUSH_TIMEOUT_MS") {
            if let Ok(val) = flush.parse::<u64>() {
                self.transport.flush_timeout = Duration::from_millis(val);
            }
        }

        Ok(())
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.service.validate());
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Service identity shared by publishers and browsers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Service type without leading underscore (e.g. "chat")
    pub service_type: String,

    /// Transport protocol label ("tcp" or "udp")
    pub transport_protocol: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_type: String::from(DEFAULT_SERVICE_TYPE),
            transport_protocol: String::from(DEFAULT_TRANSPORT_PROTOCOL),
        }
    }
}

impl ServiceConfig {
    /// The service type these settings describe
    pub fn service(&self) -> ServiceType {
        ServiceType::new(&self.service_type, &self.transport_protocol)
    }

    pub fn validate(&self) -> Vec<String> {
        match self.service().validate() {
            Ok(()) => Vec::new(),
            Err(e) => vec![e.to_string()],
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listening port, 0 lets the system assign one
    pub port: u16,

    /// IPv4 listen address
    pub ipv4_address: Ipv4Addr,

    /// IPv6 listen address
    pub ipv6_address: Ipv6Addr,

    /// Whether to attempt an IPv6 listener at all
    pub enable_ipv6: bool,

    /// Maximum number of pooled connections
    pub max_connections: usize,

    /// Upper bound for `graceful_shutdown` to wait for the pool to drain
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Advertised instance name, defaults to the host name when empty
    pub instance_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            ipv4_address: Ipv4Addr::UNSPECIFIED,
            ipv6_address: Ipv6Addr::UNSPECIFIED,
            enable_ipv6: true,
            max_connections: 1000,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            instance_name: String::new(),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.instance_name.len() > 63 {
            errors.push(format!(
                "Instance name too long: {} characters (maximum: 63)",
                self.instance_name.len()
            ));
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ClientConfig {
    /// Peer dialled by `ClientSession::connect_configured` ("host:port")
    #[serde(default)]
    pub address: Option<String>,
}

impl ClientConfig {
    /// Split the configured address into host and port
    pub fn host_port(&self) -> Option<(String, u16)> {
        let address = self.address.as_deref()?;
        let (host, port) = address.rsplit_once(':')?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some((host.to_string(), port.parse().ok()?))
    }

    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(address) = &self.address {
            if self.host_port().is_none() {
                errors.push(format!(
                    "Invalid client address format: '{address}' (expected format: 'example.local:8080')"
                ));
            }
        }

        errors
    }
}

/// Framing and stream configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum accepted incoming payload in bytes
    pub max_frame_length: usize,

    /// Initial capacity of the incoming buffer
    pub read_buffer_capacity: usize,

    /// Upper bound on flushing queued frames during `close()`
    #[serde(with = "duration_serde")]
    pub flush_timeout: Duration,

    /// Disable Nagle's algorithm on TCP streams
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_length: MAX_FRAME_LENGTH,
            read_buffer_capacity: READ_BUFFER_CAPACITY,
            flush_timeout: timeout::FLUSH_TIMEOUT,
            nodelay: true,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_length == 0 {
            errors.push("Max frame length cannot be 0".to_string());
        } else if self.max_frame_length > u32::MAX as usize {
            errors.push(format!(
                "Max frame length {} exceeds the 32-bit length prefix",
                self.max_frame_length
            ));
        }

        if self.read_buffer_capacity < 64 {
            errors.push("Read buffer capacity too small (minimum: 64 bytes)".to_string());
        }

        if self.flush_timeout.as_millis() < 10 {
            errors.push("Flush timeout too short (minimum: 10ms)".to_string());
        } else if self.flush_timeout.as_secs() > 60 {
            errors.push("Flush timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peerlink"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations travel as milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Levels travel as lowercase names
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        assert!(NetworkConfig::default().validate().is_empty());
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("PEERLINK_SERVER_PORT", "7000"),
            ("PEERLINK_ENABLE_IPV6", "false"),
            ("PEERLINK_CLIENT_ADDRESS", "10.0.0.2:7000"),
            ("PEERLINK_FLUSH_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();

        let mut config = NetworkConfig::default();
        config
            .apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 7000);
        assert!(!config.server.enable_ipv6);
        assert_eq!(
            config.client.host_port(),
            Some(("10.0.0.2".to_string(), 7000))
        );
        assert_eq!(config.transport.flush_timeout, Duration::from_millis(250));
    }

    #[test]
    fn bad_port_override_is_an_error() {
        let mut config = NetworkConfig::default();
        let result = config.apply_env_overrides(|k| {
            (k == "PEERLINK_SERVER_PORT").then(|| "not-a-port".to_string())
        });
        assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    }

    #[test]
    fn bracketed_ipv6_client_address() {
        let client = ClientConfig {
            address: Some("[::1]:9000".into()),
        };
        assert_eq!(client.host_port(), Some(("::1".to_string(), 9000)));
        assert!(client.validate().is_empty());
    }
}
