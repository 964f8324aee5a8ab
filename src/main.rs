use dotenvy::dotenv;
use std::env;
use stock_opname_lib::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting stock opname service");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = stock_opname_lib::run(config).await {
        tracing::error!("server stopped: {}", e);
        std::process::exit(1);
    }
}
