//! Relay configuration
//!
//! Server settings come from command line arguments, optionally layered over
//! a TOML file.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::frame::DEFAULT_MAX_PAYLOAD_SIZE;

/// Default listening port
pub const DEFAULT_PORT: u16 = 3000;
/// Default bind address
pub const DEFAULT_BIND: &str = "0.0.0.0";
/// Default document served for plain `GET /`
pub const DEFAULT_DOCUMENT: &str = "static/index.html";
/// Default cap on the HTTP request head (8 KiB)
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 8 * 1024;
/// Default time allowed for the request head to arrive
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
/// Default number of frames queued per connection before it counts as slow
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings that may be supplied in a TOML file
///
/// Every key is optional; missing keys keep their defaults.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Bind address
    pub bind: Option<String>,
    /// Port to listen on
    pub port: Option<u16>,
    /// Path of the document served for `GET /`
    pub document: Option<PathBuf>,
    /// Largest accepted inbound payload, in bytes
    pub max_payload_size: Option<usize>,
    /// Largest accepted HTTP request head, in bytes
    pub max_request_bytes: Option<usize>,
    /// Seconds allowed for the request head to arrive
    pub handshake_timeout_secs: Option<u64>,
    /// Frames queued per connection before it is evicted as a slow consumer
    pub outbound_queue_capacity: Option<usize>,
}

impl FileConfig {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: FileConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Configuration for the relay server and its sessions
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Document served for plain `GET /`
    pub document: PathBuf,
    /// Largest accepted inbound payload, in bytes
    pub max_payload_size: usize,
    /// Largest accepted HTTP request head, in bytes
    pub max_request_bytes: usize,
    /// Time allowed for the request head to arrive
    pub handshake_timeout: Duration,
    /// Frames queued per connection before it is evicted
    pub outbound_queue_capacity: usize,
}

impl RelayConfig {
    /// Create a configuration with default limits
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            document: PathBuf::from(DEFAULT_DOCUMENT),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        }
    }

    /// Set the document served for `GET /`
    pub fn with_document(mut self, document: impl Into<PathBuf>) -> Self {
        self.document = document.into();
        self
    }

    /// Set the inbound payload cap
    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    /// Set the request head cap
    pub fn with_max_request_bytes(mut self, max_request_bytes: usize) -> Self {
        self.max_request_bytes = max_request_bytes;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Set the per-connection outbound queue capacity
    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    /// Overlay the keys present in `file`
    pub fn merge_file(mut self, file: FileConfig) -> Self {
        if let Some(bind) = file.bind {
            self.bind = bind;
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(document) = file.document {
            self.document = document;
        }
        if let Some(size) = file.max_payload_size {
            self.max_payload_size = size;
        }
        if let Some(bytes) = file.max_request_bytes {
            self.max_request_bytes = bytes;
        }
        if let Some(secs) = file.handshake_timeout_secs {
            self.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(capacity) = file.outbound_queue_capacity {
            self.outbound_queue_capacity = capacity;
        }
        self
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_request_bytes < 16 {
            return Err(ConfigError::Invalid(format!(
                "max_request_bytes of {} cannot hold a request line",
                self.max_request_bytes
            )));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "handshake_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BIND, DEFAULT_PORT)
    }
}
