//! Chat relay server - Entry Point
//!
//! Parses flags, sets up logging, then serves until SIGINT.

use std::env;
use std::sync::Arc;

use tracing::{error, info};

use chat_relay::config::ServerConfig;
use chat_relay::{logging, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from_args(env::args().skip(1))?;
    logging::init(&config.log)?;

    let server = Arc::new(Server::bind(&config).await?);

    let serving = Arc::clone(&server);
    let accept_loop = tokio::spawn(async move {
        if let Err(e) = serving.serve().await {
            error!("Accept loop failed: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received interrupt, shutting down");

    server.shutdown(config.shutdown_timeout).await;
    accept_loop.await?;

    Ok(())
}
