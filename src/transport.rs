//! Circuit-breaker-protected outbound transport.
//!
//! One `UpstreamTransport` wraps a pooled hyper client and an optional
//! circuit breaker. Transports are created once per transport key during
//! route compilation and shared by every endpoint naming that key, so a
//! breaker opening for one endpoint also shields the others.

use http::{Request, Response};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{CircuitBreakerConfig, ProxyConfig};

/// Errors produced by an outbound call.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The circuit breaker rejected the call before it left the gateway.
    #[error("circuit breaker '{name}' is open")]
    BreakerOpen { name: String },

    /// The backend request failed at the connection or protocol level.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    /// The backend produced no response headers within the deadline.
    #[error("no response headers within {timeout_ms}ms")]
    FirstByteTimeout { timeout_ms: u64 },
}

/// Shared outbound connection pool plus its breaker.
pub struct UpstreamTransport {
    name: String,
    client: Client<HttpConnector, Incoming>,
    breaker: Option<CircuitBreaker>,
    response_header_timeout: Duration,
}

impl UpstreamTransport {
    /// Builds a transport from the proxy tuning parameters.
    ///
    /// When `breaker_config` is `None` the transport runs with breaking
    /// disabled and every call passes straight through.
    pub fn new(
        name: impl Into<String>,
        proxy: &ProxyConfig,
        breaker_config: Option<&CircuitBreakerConfig>,
    ) -> Self {
        let name = name.into();

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(proxy.dial_timeout()));
        connector.set_keepalive(Some(proxy.dial_keep_alive()));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(proxy.idle_conn_timeout())
            .pool_max_idle_per_host(proxy.max_idle_conns_per_host)
            .build(connector);

        let breaker = breaker_config
            .map(|cfg| CircuitBreaker::new(format!("crctbrkr-{name}"), cfg.clone()));

        Self {
            name,
            client,
            breaker,
            response_header_timeout: proxy.response_header_timeout(),
        }
    }

    /// Sends one request to the backend through the breaker.
    ///
    /// A connection error, a first-byte timeout or a 5xx response counts
    /// as a failure toward opening the breaker; a 5xx response is still
    /// returned to the caller so the client sees what the backend sent.
    pub async fn send(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Incoming>, TransportError> {
        if let Some(breaker) = &self.breaker {
            if !breaker.try_acquire() {
                return Err(TransportError::BreakerOpen {
                    name: self.name.clone(),
                });
            }
        }

        let outcome = match timeout(self.response_header_timeout, self.client.request(req)).await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(TransportError::Upstream(e)),
            Err(_) => Err(TransportError::FirstByteTimeout {
                timeout_ms: self.response_header_timeout.as_millis() as u64,
            }),
        };

        if let Some(breaker) = &self.breaker {
            let success = matches!(&outcome, Ok(resp) if !resp.status().is_server_error());
            breaker.record(success);
        }

        outcome
    }

    /// Returns the transport's name (its pooling key).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the breaker, when breaking is enabled.
    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }
}
