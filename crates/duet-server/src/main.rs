//! # Duet Server
//!
//! One-to-one chat relay with store-and-forward delivery.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! duet
//!
//! # Run with a specific config file
//! DUET_CONFIG=/path/to/duet.toml duet
//!
//! # Override single values through the environment
//! DUET_PORT=8080 DUET_HOST=0.0.0.0 DUET_STORE__BACKEND=memory duet
//! ```

use anyhow::Result;
use duet_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "duet=debug,duet_server=debug,duet_core=debug,tower_http=info".into()
                }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!(
        store = ?config.store.backend,
        "Starting Duet server on {}:{}",
        config.host,
        config.port
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
