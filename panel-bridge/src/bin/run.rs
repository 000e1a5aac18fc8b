use clap::Parser;
use panel_bridge::{config::Settings, server, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Settings::parse().validate()?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    server::run(config, tokio::signal::ctrl_c()).await?;

    Ok(())
}
