//! Steam Sentry - HTTP Server Entry Point
//!
//! Starts the admission API and the check scheduler loops.

use steam_sentry::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "steam_sentry=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; missing required variables exit non-zero.
    let config = Config::from_env()?;
    info!(
        working_dir = %config.working_dir.display(),
        backoff_sequence = ?config.backoff_sequence,
        "Loaded configuration"
    );

    api::serve(config).await?;

    Ok(())
}
