//! Configuration for the gateway.
//!
//! Loaded once at startup from a YAML file, validated, and then shared
//! read-only across tasks. Missing values fall back to documented defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::error::{GatewayError, Result};

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An endpoint is missing its name.
    #[error("missing name for endpoint")]
    MissingEndpointName,

    /// An endpoint is missing its route key.
    #[error("missing key for endpoint: {name}")]
    MissingEndpointKey { name: String },

    /// An endpoint is missing its backend URL.
    #[error("missing url for endpoint: {name}")]
    MissingEndpointUrl { name: String },

    /// Two endpoints share the same name.
    #[error("endpoint name '{name}' is not unique")]
    DuplicateEndpointName { name: String },

    /// Two endpoints share the same route key.
    #[error("endpoint key '{key}' is not unique")]
    DuplicateEndpointKey { key: String },

    /// An endpoint declares itself as its own shared transport.
    #[error("endpoint '{name}' cannot share a transport with itself")]
    SelfSharedTransport { name: String },

    /// No endpoints were configured.
    #[error("no endpoints configured")]
    NoEndpoints,

    /// No public-key PEM file was configured.
    #[error("no pemfile set on gateway config")]
    MissingPemFile,
}

/// A single routed endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Unique endpoint name.
    pub name: String,
    /// Unique route key, matched against the first path segment.
    pub key: String,
    /// Backend base URL (e.g. "http://orders.internal:8080").
    pub url: String,
    /// Whether requests must carry a valid bearer token.
    #[serde(default)]
    pub authenticate: bool,
    /// Name of another endpoint whose outbound transport this endpoint reuses.
    #[serde(default)]
    pub shared_transport: Option<String>,
}

impl EndpointConfig {
    /// The key under which this endpoint's outbound transport is pooled.
    ///
    /// Defaults to the endpoint's own name; a non-empty `shared_transport`
    /// overrides it so that several endpoints share one connection pool
    /// and one circuit breaker.
    pub fn transport_key(&self) -> &str {
        match self.shared_transport.as_deref() {
            Some(shared) if !shared.is_empty() => shared,
            _ => &self.name,
        }
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingEndpointName);
        }
        if self.key.is_empty() {
            return Err(ConfigError::MissingEndpointKey {
                name: self.name.clone(),
            });
        }
        if self.url.is_empty() {
            return Err(ConfigError::MissingEndpointUrl {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "endpoint [name: {}, key: {}, url: {}]",
            self.name, self.key, self.url
        )
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// Maximum time to read a request's headers, in milliseconds.
    pub read_timeout_ms: u64,
    /// Maximum time to produce a response, in milliseconds.
    pub write_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Outbound connection pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// Maximum idle connections across all backends. Accepted for config
    /// compatibility; the client pool only enforces the per-host cap.
    pub max_idle_conns: usize,
    /// Maximum idle connections per backend host.
    pub max_idle_conns_per_host: usize,
    /// Idle connection timeout, in milliseconds.
    pub idle_conn_timeout_ms: u64,
    /// TLS handshake timeout, in milliseconds. Accepted for config
    /// compatibility; backends are plain http, so no handshake occurs.
    pub tls_handshake_timeout_ms: u64,
    /// "Expect: 100-continue" timeout, in milliseconds. Accepted for
    /// config compatibility; not applied by the client pool.
    pub expect_continue_timeout_ms: u64,
    /// Connection establishment timeout, in milliseconds.
    pub dial_timeout_ms: u64,
    /// TCP keep-alive interval for established connections, in milliseconds.
    pub dial_keep_alive_ms: u64,
    /// Time-to-first-byte timeout for backend responses, in milliseconds.
    pub response_header_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: 100,
            max_idle_conns_per_host: 10,
            idle_conn_timeout_ms: 30_000,
            tls_handshake_timeout_ms: 500,
            expect_continue_timeout_ms: 500,
            dial_timeout_ms: 10_000,
            dial_keep_alive_ms: 10_000,
            response_header_timeout_ms: 3_000,
        }
    }
}

impl ProxyConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn dial_keep_alive(&self) -> Duration {
        Duration::from_millis(self.dial_keep_alive_ms)
    }

    pub fn idle_conn_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_conn_timeout_ms)
    }

    pub fn response_header_timeout(&self) -> Duration {
        Duration::from_millis(self.response_header_timeout_ms)
    }
}

/// Circuit breaker parameters. Absence of this section disables breaking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Trial calls allowed through while half-open.
    pub max_half_open_requests: u32,
    /// Interval after which the failure counter is cleared while closed,
    /// in milliseconds.
    pub clear_failure_count_interval_ms: u64,
    /// Time spent open before allowing trial calls, in milliseconds.
    pub half_open_after_ms: u64,
    /// Consecutive failures that open the breaker.
    pub failures_to_open: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_half_open_requests: 1,
            clear_failure_count_interval_ms: 10_000,
            half_open_after_ms: 5_000,
            failures_to_open: 10,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn clear_failure_count_interval(&self) -> Duration {
        Duration::from_millis(self.clear_failure_count_interval_ms)
    }

    pub fn half_open_after(&self) -> Duration {
        Duration::from_millis(self.half_open_after_ms)
    }
}

/// Gateway-level authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySection {
    /// Path to the RSA public key PEM used for token verification.
    #[serde(rename = "pemfile")]
    pub pem_file: String,
    /// Number of authentication workers.
    pub auth_workers: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            pem_file: String::new(),
            auth_workers: 4,
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Config {
    /// Parses and validates a YAML configuration document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml_ng::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the configuration file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| GatewayError::ReadFile {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_yaml(&content)
    }

    /// Validates endpoint uniqueness and required fields.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No endpoints are configured
    /// - An endpoint is missing its name, key or URL
    /// - Two endpoints share a name or a route key
    /// - An endpoint names itself as its shared transport
    /// - No public key PEM file is configured
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        let mut names = HashSet::new();
        let mut keys = HashSet::new();

        for ep in &self.endpoints {
            ep.validate()?;

            if !names.insert(ep.name.as_str()) {
                return Err(ConfigError::DuplicateEndpointName {
                    name: ep.name.clone(),
                });
            }
            if !keys.insert(ep.key.as_str()) {
                return Err(ConfigError::DuplicateEndpointKey {
                    key: ep.key.clone(),
                });
            }
            if ep
                .shared_transport
                .as_deref()
                .is_some_and(|shared| shared == ep.name)
            {
                return Err(ConfigError::SelfSharedTransport {
                    name: ep.name.clone(),
                });
            }
        }

        if self.gateway.pem_file.is_empty() {
            return Err(ConfigError::MissingPemFile);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, key: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            key: key.to_string(),
            url: format!("http://{name}.internal:8080"),
            authenticate: false,
            shared_transport: None,
        }
    }

    fn valid_config() -> Config {
        Config {
            gateway: GatewaySection {
                pem_file: "assets/public.pem".to_string(),
                auth_workers: 4,
            },
            endpoints: vec![endpoint("svc1", "service1"), endpoint("svc2", "service2")],
            server: ServerConfig::default(),
            proxy: ProxyConfig::default(),
            circuit_breaker: None,
        }
    }

    #[test]
    fn test_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.port, 8080);
        assert_eq!(server.read_timeout(), Duration::from_secs(10));
        assert_eq!(server.write_timeout(), Duration::from_secs(10));

        let proxy = ProxyConfig::default();
        assert_eq!(proxy.max_idle_conns, 100);
        assert_eq!(proxy.max_idle_conns_per_host, 10);
        assert_eq!(proxy.response_header_timeout(), Duration::from_secs(3));

        let breaker = CircuitBreakerConfig::default();
        assert_eq!(breaker.max_half_open_requests, 1);
        assert_eq!(breaker.failures_to_open, 10);
        assert_eq!(breaker.half_open_after(), Duration::from_secs(5));

        assert_eq!(GatewaySection::default().auth_workers, 4);
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
gateway:
  pemfile: assets/public.pem
  authWorkers: 8
server:
  port: 9000
  readTimeoutMs: 5000
  writeTimeoutMs: 5000
proxy:
  maxIdleConns: 50
  responseHeaderTimeoutMs: 1500
circuitBreaker:
  failuresToOpen: 3
  halfOpenAfterMs: 1000
endpoints:
  - name: svc1
    key: service1
    url: http://svc1.internal:8080
  - name: svc2
    key: service2
    url: http://svc2.internal:8080
    authenticate: true
    sharedTransport: svc1
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.gateway.auth_workers, 8);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.proxy.max_idle_conns, 50);
        // Unspecified proxy fields keep their defaults.
        assert_eq!(config.proxy.max_idle_conns_per_host, 10);

        let breaker = config.circuit_breaker.unwrap();
        assert_eq!(breaker.failures_to_open, 3);
        assert_eq!(breaker.max_half_open_requests, 1);

        assert_eq!(config.endpoints.len(), 2);
        assert!(config.endpoints[1].authenticate);
        assert_eq!(config.endpoints[1].transport_key(), "svc1");
        assert_eq!(config.endpoints[0].transport_key(), "svc1");
    }

    #[test]
    fn test_missing_breaker_section_disables_breaking() {
        let yaml = r#"
gateway:
  pemfile: assets/public.pem
endpoints:
  - name: svc1
    key: service1
    url: http://svc1.internal:8080
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.circuit_breaker.is_none());
    }

    #[test]
    fn test_validate_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_no_endpoints() {
        let config = Config {
            endpoints: vec![],
            ..valid_config()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::NoEndpoints
        ));
    }

    #[test]
    fn test_validate_duplicate_name() {
        let config = Config {
            endpoints: vec![endpoint("svc1", "service1"), endpoint("svc1", "service2")],
            ..valid_config()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::DuplicateEndpointName { name } if name == "svc1"
        ));
    }

    #[test]
    fn test_validate_duplicate_key() {
        let config = Config {
            endpoints: vec![endpoint("svc1", "service1"), endpoint("svc2", "service1")],
            ..valid_config()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::DuplicateEndpointKey { key } if key == "service1"
        ));
    }

    #[test]
    fn test_validate_self_shared_transport() {
        let mut ep = endpoint("svc1", "service1");
        ep.shared_transport = Some("svc1".to_string());
        let config = Config {
            endpoints: vec![ep],
            ..valid_config()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::SelfSharedTransport { .. }
        ));
    }

    #[test]
    fn test_validate_missing_fields() {
        let mut ep = endpoint("svc1", "service1");
        ep.url = String::new();
        let config = Config {
            endpoints: vec![ep],
            ..valid_config()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::MissingEndpointUrl { .. }
        ));

        let mut ep = endpoint("svc1", "service1");
        ep.key = String::new();
        let config = Config {
            endpoints: vec![ep],
            ..valid_config()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::MissingEndpointKey { .. }
        ));
    }

    #[test]
    fn test_validate_missing_pemfile() {
        let mut config = valid_config();
        config.gateway.pem_file = String::new();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::MissingPemFile
        ));
    }

    #[test]
    fn test_empty_shared_transport_falls_back_to_name() {
        let mut ep = endpoint("svc1", "service1");
        ep.shared_transport = Some(String::new());
        assert_eq!(ep.transport_key(), "svc1");
    }
}
