// `main.rs` only declares modules, sets up logging and delegates to
// `app::run()`. Relay lines go to stdout; everything logged through
// `tracing` goes to stderr so the two never interleave on one stream.
mod app;
mod cellular;
mod config;
mod error;
mod message;
mod mqtt;
mod relay;

use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    app::run().await
}
