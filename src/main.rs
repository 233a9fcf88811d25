//! replicad - server-authoritative object replication daemon.

use replicad::config::{self, Config};
use replicad::state::DefaultResolver;
use replicad::{Server, http, metrics};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let loaded = Config::load(&config_path);

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = loaded.as_ref().is_ok_and(|c| c.logging.json);
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    let config = loaded.map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    if let Err(errors) = config::validate(&config) {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        return Err(anyhow::anyhow!(
            "Refusing to start with {} configuration error(s)",
            errors.len()
        ));
    }

    info!(server = %config.server.name, "Starting replicad");

    let server = Server::build(&config, Arc::new(DefaultResolver)).await?;
    let shutdown = Arc::clone(server.shutdown_manager());

    match config.server.metrics_port {
        None | Some(0) => info!("Metrics disabled"),
        Some(port) => {
            metrics::init();
            info!("Metrics initialized");
            tokio::spawn(http::run_http_server(port, shutdown.subscribe_shutdown()));
        }
    }

    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received");
                    shutdown.queue_shutdown();
                }
                Err(e) => error!(error = %e, "Failed to listen for interrupt"),
            }
        });
    }

    info!(address = %server.local_addr()?, "Accepting clients");
    let stats = server.run().await?;
    info!(
        events = stats.events_processed,
        dropped = stats.events_dropped,
        max_queue = stats.max_queue_size,
        "Shutdown complete"
    );
    Ok(())
}
