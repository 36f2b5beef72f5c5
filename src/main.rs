//! Gateway entry point.
//!
//! Loads and validates the configuration, builds the authentication pool
//! and the dispatcher, then serves until a termination signal arrives.
//! Startup failures exit with status 1 before any traffic is served.

use std::env;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

use rust_gateway::auth::TokenVerifier;
use rust_gateway::auth_pool::AuthPool;
use rust_gateway::config::Config;
use rust_gateway::dispatcher::DispatcherBuilder;
use rust_gateway::server::{shutdown_signal, GatewayServer};

const DEFAULT_CONFIG_PATH: &str = "gateway.yml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("fatal error: {e}");
        std::process::exit(1);
    }
}

fn config_path() -> String {
    env::args()
        .nth(1)
        .or_else(|| env::var("GATEWAY_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

async fn run() -> rust_gateway::Result<()> {
    let path = config_path();
    info!("loading config from {path}");
    let config = Config::from_file(&path)?;

    for ep in &config.endpoints {
        info!("found {ep}");
    }

    let verifier = TokenVerifier::from_pem_file(&config.gateway.pem_file)?;
    info!("using {} auth workers", config.gateway.auth_workers);
    let auth_pool = Arc::new(AuthPool::new(config.gateway.auth_workers, verifier));

    let dispatcher = DispatcherBuilder::new()
        .endpoints(config.endpoints.clone())
        .proxy_config(config.proxy.clone())
        .circuit_breaker_config(config.circuit_breaker.clone())
        .auth_pool(auth_pool)
        .build()?;

    info!("starting server on port {}", config.server.port);
    let server = GatewayServer::bind(&config.server, Arc::new(dispatcher)).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut server_task = tokio::spawn(server.serve(shutdown_rx));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutting down the server...");
            let _ = shutdown_tx.send(());
            match server_task.await {
                Ok(result) => result?,
                Err(e) => error!("server task join error: {e}"),
            }
            info!("server gracefully stopped");
        }
        result = &mut server_task => {
            match result {
                Ok(result) => result?,
                Err(e) => error!("server task join error: {e}"),
            }
        }
    }

    info!("exiting...");
    Ok(())
}
