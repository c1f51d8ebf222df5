//! Switchboard server binary.

use std::path::PathBuf;

use switchboard::api;
use switchboard::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,switchboard=debug")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("switchboard.yaml"));
    let config = Config::load(&config_path)?;

    api::serve(config).await
}
