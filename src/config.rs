//! # Configuration Management
//!
//! Centralized configuration for the transport core.
//!
//! All transport settings (pool sizes, segment size, framing, timeouts) are
//! fixed when a manager is built and cannot change at runtime.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`FRAMEWIRE_*` variables)

use crate::core::token::{ByteOrder, FrameFormat, LengthPrefix};
use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default number of contexts per pool
pub const DEFAULT_POOL_SIZE: usize = 25;

/// Default segment size per context (bytes)
pub const DEFAULT_BUFFER_SIZE: usize = 65535;

/// Default maximum frame body size (4 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Default upper bound for the whole buffer arena (256 MB)
pub const DEFAULT_ARENA_CEILING: usize = 256 * 1024 * 1024;

/// Default idle window before a silent connection is closed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default timeout for outgoing connection attempts
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of queued sends per connection
pub const DEFAULT_SEND_QUEUE_LIMIT: usize = 64;

/// Largest segment size accepted by validation (16 MB)
const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport configuration
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

        if let Ok(addr) = std::env::var("FRAMEWIRE_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("FRAMEWIRE_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Some(val) = env_parse::<usize>("FRAMEWIRE_RECEIVE_COUNT")? {
            config.transport.receive_count = val;
        }

        if let Some(val) = env_parse::<usize>("FRAMEWIRE_SEND_COUNT")? {
            config.transport.send_count = val;
        }

        if let Some(val) = env_parse::<usize>("FRAMEWIRE_BUFFER_SIZE")? {
            config.transport.buffer_size = val;
        }

        if let Some(val) = env_parse::<usize>("FRAMEWIRE_MAX_FRAME_SIZE")? {
            config.transport.max_frame_size = val;
        }

        if let Some(val) = env_parse::<u64>("FRAMEWIRE_IDLE_TIMEOUT_MS")? {
            config.transport.idle_timeout = Duration::from_millis(val);
        }

        Ok(config)
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
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        into_result(self.validate())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {key}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

fn into_result(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9339")
    pub address: String,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9339"),
            shutdown_timeout: Duration::from_secs(10),
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:9339')",
                self.address
            ));
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Timeout for connection attempts
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9339"),
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: '127.0.0.1:9339')",
                self.address
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Transport configuration, fixed at startup
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Number of receive operation contexts
    pub receive_count: usize,

    /// Number of send operation contexts
    pub send_count: usize,

    /// Segment size of each context in bytes
    pub buffer_size: usize,

    /// Maximum frame body size in bytes
    pub max_frame_size: usize,

    /// Width of the frame length prefix
    #[serde(default)]
    pub length_prefix: LengthPrefix,

    /// Byte order of the frame length prefix
    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Connections without traffic for this long are closed
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Upper bound for the buffer arena in bytes
    pub arena_ceiling: usize,

    /// Maximum number of queued sends per connection
    pub send_queue_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            receive_count: DEFAULT_POOL_SIZE,
            send_count: DEFAULT_POOL_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            length_prefix: LengthPrefix::default(),
            byte_order: ByteOrder::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            arena_ceiling: DEFAULT_ARENA_CEILING,
            send_queue_limit: DEFAULT_SEND_QUEUE_LIMIT,
        }
    }
}

impl TransportConfig {
    /// Frame layout described by this configuration
    pub fn frame_format(&self) -> FrameFormat {
        FrameFormat::new(self.length_prefix, self.byte_order, self.max_frame_size)
    }

    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.receive_count == 0 {
            errors.push("Receive count must be greater than 0".to_string());
        }

        if self.send_count == 0 {
            errors.push("Send count must be greater than 0".to_string());
        }

        if self.buffer_size == 0 {
            errors.push("Buffer size cannot be 0".to_string());
        } else if self.buffer_size > MAX_BUFFER_SIZE {
            errors.push(format!(
                "Buffer size too large: {} bytes (maximum: 16 MB)",
                self.buffer_size
            ));
        }

        let arena = self
            .receive_count
            .checked_add(self.send_count)
            .and_then(|count| count.checked_mul(self.buffer_size));
        match arena {
            Some(total) if total > self.arena_ceiling => errors.push(format!(
                "Arena of {total} bytes exceeds arena ceiling of {} bytes",
                self.arena_ceiling
            )),
            None => errors.push("Arena size overflows".to_string()),
            _ => {}
        }

        if self.max_frame_size == 0 {
            errors.push("Max frame size cannot be 0".to_string());
        } else if self.max_frame_size > self.length_prefix.max_value() {
            errors.push(format!(
                "Max frame size {} cannot be expressed by a {}-byte length prefix",
                self.max_frame_size,
                self.length_prefix.width()
            ));
        }

        if self.idle_timeout.as_millis() < 100 {
            errors.push("Idle timeout too short (minimum: 100ms)".to_string());
        }

        if self.send_queue_limit == 0 {
            errors.push("Send queue limit must be greater than 0".to_string());
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        into_result(self.validate())
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

    /// Whether to use JSON formatting for logs
    pub json_format: bool,

    /// Whether to include the event target in log lines
    #[serde(default)]
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("framewire"),
            log_level: Level::INFO,
            json_format: false,
            with_target: false,
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

        errors
    }
}

/// Helper module for Duration serialization/deserialization
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

/// Helper module for tracing::Level serialization/deserialization
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
