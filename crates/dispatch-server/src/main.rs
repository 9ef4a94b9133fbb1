use anyhow::Context;
use clap::Parser;
use dispatch_server::{config, logging, server::App, shutdown};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = config::Args::parse();
    logging::setup_logging(&args)?;

    info!("starting dispatch server");
    info!("version: {}", env!("CARGO_PKG_VERSION"));

    let settings = config::load(&args)
        .await
        .context("failed to load configuration")?;

    let mut app = App::new(settings).context("failed to initialize server")?;
    app.bind().await.context("failed to bind listener")?;

    let handle = app.shutdown_handle();
    let shutdown_rx = shutdown::setup_shutdown_handler().await;
    tokio::spawn(async move {
        let _ = shutdown_rx.await;
        handle.shutdown();
    });

    app.run().await?;
    info!("application shut down successfully");
    Ok(())
}
