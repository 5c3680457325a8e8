//! Voxel Skirmish - Dedicated Server

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting Voxel Skirmish Dedicated Server");

    let config = match std::env::args().nth(1) {
        Some(path) => match std::fs::read_to_string(&path) {
            Ok(text) => match vox_server::ServerConfig::from_ron(&text) {
                Ok(config) => config,
                Err(error) => {
                    tracing::error!(%error, path, "invalid config file");
                    std::process::exit(1);
                }
            },
            Err(error) => {
                tracing::error!(%error, path, "cannot read config file");
                std::process::exit(1);
            }
        },
        None => vox_server::ServerConfig::default(),
    };

    if let Err(error) = vox_server::network::run(config).await {
        tracing::error!(%error, "server terminated");
        std::process::exit(1);
    }
}
