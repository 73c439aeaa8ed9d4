//! `skiff-weather`: an MCP tool server for US weather alerts and forecasts.
//!
//! Speaks MCP on stdin/stdout. Logs go to stderr.

mod nws;
mod tools;

use std::sync::Arc;

use mcp::Server;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use nws::{NWS_API_BASE, NwsClient, NwsError};

/// Overrides the NWS API root (used by tests and mirrors).
const BASE_URL_ENV: &str = "SKIFF_NWS_BASE_URL";

#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    Nws(#[from] NwsError),

    #[error(transparent)]
    Mcp(#[from] mcp::Error),
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "weather server failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let base_url = std::env::var(BASE_URL_ENV).unwrap_or_else(|_| NWS_API_BASE.to_string());
    let nws = Arc::new(NwsClient::new(base_url)?);
    let registry = tools::registry(nws)?;

    Server::new("weather", env!("CARGO_PKG_VERSION"), registry)
        .serve_stdio()
        .await?;
    Ok(())
}

/// Log to stderr only; stdout carries the protocol.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
