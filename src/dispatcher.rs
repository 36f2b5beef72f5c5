//! Route table and per-request stage chains.
//!
//! The dispatcher maps the first path segment of a request to a compiled
//! route and runs that route's stage chain: optionally an authentication
//! stage, then always a terminal proxy stage. Routes and their shared
//! transports are compiled once at startup and read-only afterwards.

use http::header::{HeaderValue, AUTHORIZATION};
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth_pool::AuthPool;
use crate::config::{CircuitBreakerConfig, EndpointConfig, ProxyConfig};
use crate::error::{GatewayError, Result};
use crate::transport::{TransportError, UpstreamTransport};

/// Response body type used throughout the gateway.
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Headers that must not be forwarded to the backend.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Builds a plain-text error response.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<GatewayBody> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed();
    Response::builder()
        .status(status)
        .body(body)
        .unwrap_or_else(|_| Response::new(Empty::new().map_err(|never| match never {}).boxed()))
}

/// Terminal stage: reverse-proxies the request to the endpoint's backend.
struct ProxyStage {
    /// Backend base URL with any trailing slash removed.
    base: String,
    transport: Arc<UpstreamTransport>,
}

impl ProxyStage {
    async fn forward(
        &self,
        mut req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Response<GatewayBody> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let upstream_uri: Uri = match format!("{}{}", self.base, path_and_query).parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(base = %self.base, error = %e, "failed to build upstream uri");
                return error_response(StatusCode::BAD_GATEWAY, "bad gateway");
            }
        };

        debug!(uri = %upstream_uri, "forwarding to upstream");
        *req.uri_mut() = upstream_uri;
        prepare_proxy_headers(req.headers_mut(), peer);

        match self.transport.send(req).await {
            Ok(response) => {
                debug!(status = %response.status(), upstream = %self.transport.name(), "upstream responded");
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, body.boxed())
            }
            Err(TransportError::BreakerOpen { name }) => {
                debug!(transport = %name, "rejected by open circuit breaker");
                error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable")
            }
            Err(e @ TransportError::FirstByteTimeout { .. }) => {
                warn!(upstream = %self.transport.name(), error = %e, "upstream timed out");
                error_response(StatusCode::GATEWAY_TIMEOUT, "upstream timed out")
            }
            Err(e) => {
                warn!(upstream = %self.transport.name(), error = %e, "upstream request failed");
                error_response(StatusCode::BAD_GATEWAY, "bad gateway")
            }
        }
    }
}

/// Strips hop-by-hop headers and appends the client to `x-forwarded-for`.
fn prepare_proxy_headers(headers: &mut HeaderMap, peer: SocketAddr) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }

    let client_ip = peer.ip().to_string();
    let forwarded = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{prior}, {client_ip}"),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert("x-forwarded-for", value);
    }
}

/// One step of a route's request-handling chain.
enum Stage {
    /// Validates the Authorization header via the worker pool; halts the
    /// chain with an error response on failure.
    Authenticate(Arc<AuthPool>),
    /// Terminal stage, always last in a chain.
    Proxy(ProxyStage),
}

/// Ordered, short-circuiting sequence of stages.
///
/// Compiled once per route; the chain always ends in exactly one proxy
/// stage, and any earlier stage may halt execution by producing a
/// complete response itself.
struct StageChain {
    stages: Vec<Stage>,
}

impl StageChain {
    async fn execute(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<GatewayBody> {
        for stage in &self.stages {
            match stage {
                Stage::Authenticate(pool) => {
                    if let Some(halt) = authenticate_request(pool, req.headers()).await {
                        return halt;
                    }
                }
                Stage::Proxy(proxy) => return proxy.forward(req, peer).await,
            }
        }
        // Construction guarantees a terminal proxy stage.
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "no terminal stage")
    }
}

/// Runs the authentication stage against the request headers.
///
/// Returns `None` to continue the chain, or the halting response: 401 for
/// a missing/unreadable header, otherwise 403 "forbidden".
async fn authenticate_request(
    pool: &AuthPool,
    headers: &HeaderMap,
) -> Option<Response<GatewayBody>> {
    let credential = match headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(value) => value.to_string(),
        None => {
            info!("authentication failed: no authorization header");
            return Some(error_response(StatusCode::UNAUTHORIZED, "unauthorized"));
        }
    };

    match pool.authenticate(credential).await {
        Ok(claims) => {
            debug!(claims = claims.len(), "authenticated");
            None
        }
        Err(e) => {
            info!(error = %e, "authentication failed");
            Some(error_response(StatusCode::FORBIDDEN, "forbidden"))
        }
    }
}

/// A compiled route: the endpoint's own copy of its configuration plus
/// its stage chain.
struct Route {
    endpoint: EndpointConfig,
    chain: StageChain,
}

/// Builder for the dispatcher.
///
/// Collects the validated endpoint list, proxy tuning, optional breaker
/// parameters and the optional auth pool, then compiles the route table.
#[derive(Default)]
pub struct DispatcherBuilder {
    endpoints: Vec<EndpointConfig>,
    proxy: ProxyConfig,
    breaker: Option<CircuitBreakerConfig>,
    auth_pool: Option<Arc<AuthPool>>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoints(mut self, endpoints: Vec<EndpointConfig>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn proxy_config(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn circuit_breaker_config(mut self, breaker: Option<CircuitBreakerConfig>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn auth_pool(mut self, pool: Arc<AuthPool>) -> Self {
        self.auth_pool = Some(pool);
        self
    }

    /// Compiles the route table.
    ///
    /// Transports are created once per transport key and reused for every
    /// endpoint naming that key, so shared endpoints end up behind one
    /// connection pool and one breaker.
    pub fn build(self) -> Result<Dispatcher> {
        let mut transports: HashMap<String, Arc<UpstreamTransport>> = HashMap::new();
        let mut routes = HashMap::new();

        for ep in &self.endpoints {
            let base = validate_base_url(ep)?;

            let key = ep.transport_key().to_string();
            let transport = transports
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(UpstreamTransport::new(key, &self.proxy, self.breaker.as_ref()))
                })
                .clone();

            let mut stages = Vec::new();
            if ep.authenticate {
                let pool = self.auth_pool.clone().ok_or_else(|| {
                    GatewayError::AuthNotConfigured {
                        endpoint: ep.name.clone(),
                    }
                })?;
                stages.push(Stage::Authenticate(pool));
            }
            stages.push(Stage::Proxy(ProxyStage { base, transport }));

            routes.insert(
                ep.key.clone(),
                Route {
                    endpoint: ep.clone(),
                    chain: StageChain { stages },
                },
            );
        }

        Ok(Dispatcher { routes })
    }
}

/// Checks that an endpoint URL is absolute plain http and returns it with
/// any trailing slash removed, ready for path concatenation.
///
/// An `https` URL is rejected here rather than failing on every request:
/// the outbound connector speaks plain HTTP only, so such a backend would
/// be permanently unreachable and would feed its circuit breaker nothing
/// but failures.
fn validate_base_url(ep: &EndpointConfig) -> Result<String> {
    let invalid = || GatewayError::InvalidEndpointUrl {
        endpoint: ep.name.clone(),
        url: ep.url.clone(),
    };

    let uri: Uri = ep.url.parse().map_err(|_| invalid())?;
    match uri.scheme_str() {
        Some("http") if uri.authority().is_some() => {}
        Some("https") => {
            return Err(GatewayError::UnsupportedUrlScheme {
                endpoint: ep.name.clone(),
                url: ep.url.clone(),
            })
        }
        _ => return Err(invalid()),
    }

    Ok(ep.url.trim_end_matches('/').to_string())
}

/// Lookup-and-execute layer over the compiled routes.
///
/// Performs no authentication or proxying itself; it only selects a stage
/// chain by the request's first path segment and runs it.
pub struct Dispatcher {
    routes: HashMap<String, Route>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Dispatcher {
    /// Dispatches one request, producing a complete response.
    pub async fn dispatch(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Response<GatewayBody> {
        match route_key(req.uri().path()).and_then(|key| self.routes.get(key)) {
            Some(route) => {
                debug!(endpoint = %route.endpoint.name, path = %req.uri().path(), "matched route");
                route.chain.execute(req, peer).await
            }
            None => {
                debug!(path = %req.uri().path(), "no matching route");
                error_response(StatusCode::NOT_FOUND, "not found")
            }
        }
    }

    /// Number of compiled routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns true if no routes were compiled.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The first non-empty path segment, used as the route lookup key.
fn route_key(path: &str) -> Option<&str> {
    path.split('/').find(|segment| !segment.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_keys::PUBLIC_PEM;
    use crate::auth::TokenVerifier;
    use crate::config::ConfigError;

    fn endpoint(name: &str, key: &str, url: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            key: key.to_string(),
            url: url.to_string(),
            authenticate: false,
            shared_transport: None,
        }
    }

    fn auth_pool() -> Arc<AuthPool> {
        let verifier = TokenVerifier::from_pem(PUBLIC_PEM.as_bytes()).unwrap();
        Arc::new(AuthPool::new(1, verifier))
    }

    #[test]
    fn test_route_key_extraction() {
        assert_eq!(route_key("/service1/anything"), Some("service1"));
        assert_eq!(route_key("/service1"), Some("service1"));
        assert_eq!(route_key("//service1"), Some("service1"));
        assert_eq!(route_key("/"), None);
        assert_eq!(route_key(""), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_indexes_routes_by_key() {
        let dispatcher = DispatcherBuilder::new()
            .endpoints(vec![
                endpoint("svc1", "service1", "http://127.0.0.1:9001"),
                endpoint("svc2", "service2", "http://127.0.0.1:9002"),
            ])
            .build()
            .unwrap();

        assert_eq!(dispatcher.len(), 2);
        assert!(dispatcher.routes.contains_key("service1"));
        assert!(dispatcher.routes.contains_key("service2"));
        assert_eq!(dispatcher.routes["service1"].endpoint.name, "svc1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shared_transport_is_reused() {
        let mut svc2 = endpoint("svc2", "service2", "http://127.0.0.1:9002");
        svc2.shared_transport = Some("svc1".to_string());

        let dispatcher = DispatcherBuilder::new()
            .endpoints(vec![
                endpoint("svc1", "service1", "http://127.0.0.1:9001"),
                svc2,
            ])
            .build()
            .unwrap();

        let transport_of = |key: &str| {
            let route = &dispatcher.routes[key];
            match route.chain.stages.last() {
                Some(Stage::Proxy(proxy)) => Arc::clone(&proxy.transport),
                _ => panic!("missing terminal proxy stage"),
            }
        };

        assert!(Arc::ptr_eq(&transport_of("service1"), &transport_of("service2")));
        assert_eq!(transport_of("service1").name(), "svc1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_distinct_endpoints_get_distinct_transports() {
        let dispatcher = DispatcherBuilder::new()
            .endpoints(vec![
                endpoint("svc1", "service1", "http://127.0.0.1:9001"),
                endpoint("svc2", "service2", "http://127.0.0.1:9002"),
            ])
            .build()
            .unwrap();

        let transport_of = |key: &str| {
            let route = &dispatcher.routes[key];
            match route.chain.stages.last() {
                Some(Stage::Proxy(proxy)) => Arc::clone(&proxy.transport),
                _ => panic!("missing terminal proxy stage"),
            }
        };

        assert!(!Arc::ptr_eq(&transport_of("service1"), &transport_of("service2")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_rejects_invalid_url() {
        let result = DispatcherBuilder::new()
            .endpoints(vec![endpoint("svc1", "service1", "not a url")])
            .build();
        assert!(matches!(
            result.unwrap_err(),
            GatewayError::InvalidEndpointUrl { endpoint, .. } if endpoint == "svc1"
        ));

        let result = DispatcherBuilder::new()
            .endpoints(vec![endpoint("svc1", "service1", "ftp://127.0.0.1:9001")])
            .build();
        assert!(matches!(
            result.unwrap_err(),
            GatewayError::InvalidEndpointUrl { .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_rejects_https_url() {
        let result = DispatcherBuilder::new()
            .endpoints(vec![endpoint("svc1", "service1", "https://127.0.0.1:9443")])
            .build();
        assert!(matches!(
            result.unwrap_err(),
            GatewayError::UnsupportedUrlScheme { endpoint, .. } if endpoint == "svc1"
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_rejects_auth_without_pool() {
        let mut ep = endpoint("svc1", "service1", "http://127.0.0.1:9001");
        ep.authenticate = true;

        let result = DispatcherBuilder::new().endpoints(vec![ep]).build();
        assert!(matches!(
            result.unwrap_err(),
            GatewayError::AuthNotConfigured { endpoint } if endpoint == "svc1"
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_authenticated_endpoint_gets_two_stages() {
        let mut ep = endpoint("svc1", "service1", "http://127.0.0.1:9001");
        ep.authenticate = true;

        let dispatcher = DispatcherBuilder::new()
            .endpoints(vec![ep])
            .auth_pool(auth_pool())
            .build()
            .unwrap();

        let chain = &dispatcher.routes["service1"].chain;
        assert_eq!(chain.stages.len(), 2);
        assert!(matches!(chain.stages[0], Stage::Authenticate(_)));
        assert!(matches!(chain.stages[1], Stage::Proxy(_)));
    }

    #[test]
    fn test_trailing_slash_trimmed_from_base() {
        let ep = endpoint("svc1", "service1", "http://127.0.0.1:9001/");
        assert_eq!(validate_base_url(&ep).unwrap(), "http://127.0.0.1:9001");
    }

    // Uniqueness is enforced by config validation before the builder runs.
    #[test]
    fn test_config_validation_precedes_builder() {
        let config = crate::config::Config {
            gateway: crate::config::GatewaySection {
                pem_file: "key.pem".into(),
                auth_workers: 4,
            },
            endpoints: vec![
                endpoint("svc1", "service1", "http://127.0.0.1:9001"),
                endpoint("svc1", "service2", "http://127.0.0.1:9002"),
            ],
            server: Default::default(),
            proxy: Default::default(),
            circuit_breaker: None,
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::DuplicateEndpointName { .. }
        ));
    }
}
