//! Error types for the gateway.

use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while building or running the gateway.
///
/// Every variant here is a startup-time failure. Once the server is
/// accepting traffic, request-level problems are turned into HTTP
/// responses instead of errors.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Configuration file could not be parsed as YAML.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml_ng::Error),

    /// A required file could not be read.
    #[error("failed to read {path}: {source}")]
    ReadFile { path: String, source: io::Error },

    /// The configured public key is not a valid RSA PEM.
    #[error("invalid public key: {0}")]
    InvalidKey(#[from] jsonwebtoken::errors::Error),

    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// An endpoint's backend URL is not an absolute http URL.
    #[error("invalid url '{url}' for endpoint '{endpoint}'")]
    InvalidEndpointUrl { endpoint: String, url: String },

    /// An endpoint's backend URL uses a scheme the outbound transport
    /// does not speak.
    #[error("unsupported scheme in url '{url}' for endpoint '{endpoint}': only plain http backends are supported")]
    UnsupportedUrlScheme { endpoint: String, url: String },

    /// An endpoint requires authentication but no auth pool was supplied.
    #[error("endpoint '{endpoint}' requires authentication but no auth pool is configured")]
    AuthNotConfigured { endpoint: String },
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
