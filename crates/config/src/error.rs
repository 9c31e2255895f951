//! Configuration error types

use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("reading config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML of the expected shape
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value fails validation
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
