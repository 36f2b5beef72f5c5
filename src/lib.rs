//! API gateway: a single front-door HTTP server that authenticates and
//! routes requests to configured backend services, protecting them with
//! per-backend circuit breaking and pooled outbound connections.

pub mod auth;
pub mod auth_pool;
pub mod circuit_breaker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod server;
pub mod transport;

pub use auth::TokenVerifier;
pub use auth_pool::AuthPool;
pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::{GatewayError, Result};
pub use server::GatewayServer;
