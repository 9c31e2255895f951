//! Plenum Configuration
//!
//! TOML-based configuration loading with sensible defaults.
//! Minimal config should just work - only specify what you need to
//! change.
//!
//! # Example Minimal Config
//!
//! ```toml
//! [datastore]
//! url = "http://localhost:9010"
//! ```
//!
//! # Example Full Config
//!
//! ```toml
//! [http]
//! host = "0.0.0.0"
//! port = 9012
//!
//! [datastore]
//! url = "http://datastore-reader:9010"
//! timeout_secs = 10
//! max_retries = 5
//!
//! [log]
//! level = "debug"
//! ```

mod error;

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

pub use error::{ConfigError, Result};

/// Main configuration structure
///
/// All sections are optional with sensible defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP front door
    pub http: HttpConfig,

    /// Remote datastore reader
    pub datastore: DatastoreConfig,

    /// Logging configuration
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains
    /// invalid TOML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = contents.parse()?;
        Ok(config)
    }

    /// Validate the configuration as a whole.
    pub fn validate(&self) -> Result<()> {
        if self.http.port == 0 {
            return Err(ConfigError::Invalid("http.port must not be 0".to_string()));
        }
        if self.datastore.url.is_empty() {
            return Err(ConfigError::Invalid(
                "datastore.url must not be empty".to_string(),
            ));
        }
        if !self.datastore.url.starts_with("http://") && !self.datastore.url.starts_with("https://")
        {
            return Err(ConfigError::Invalid(format!(
                "datastore.url must be an http(s) url, got `{}`",
                self.datastore.url
            )));
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9012,
        }
    }
}

impl HttpConfig {
    /// The socket address string to bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Remote datastore reader settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    /// Base url of the reader service
    pub url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Retry attempts for transient reader failures
    pub max_retries: u32,
    /// Base backoff delay in milliseconds, doubled per retry
    pub retry_base_delay_ms: u64,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9010".to_string(),
            timeout_secs: 10,
            max_retries: 3,
            retry_base_delay_ms: 200,
        }
    }
}

impl DatastoreConfig {
    /// Request timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Base retry delay as a `Duration`.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
