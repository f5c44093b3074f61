use anyhow::Context;
use clap::Parser;
use configurator_core::Configurator;
use configurator_server::{open_store, router, Cli, ServerSettings};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = ServerSettings::load(cli.config.as_deref())?;

    let store = open_store(&cli.store, &settings.store)
        .with_context(|| format!("opening store {:?}", cli.store))?;
    let config = Configurator::new(store, cli.pipeline_settings(&settings))?;

    config.pull().await.context("initial pull")?;
    if let Err(err) = config.update().await {
        warn!(error = %err, "initial render failed, serving last known state");
    }

    let address = settings.address(cli.port(&settings));
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {}", address))?;
    info!(address = %address, "listening");

    axum::serve(listener, router(config)).await?;
    Ok(())
}
