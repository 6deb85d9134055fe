mod args;

use std::process::ExitCode;

use anyhow::{Context as _, Result, anyhow};
use args::Args;
use clap::Parser as _;
use temps::{
    config::Config,
    pipeline,
    sensor::Sensor,
    store::StoreClient,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = run().await {
        eprintln!("{e:#}");
        return ExitCode::from(1);
    }

    ExitCode::from(0)
}

async fn run() -> Result<()> {
    let args = Args::parse();
    init_tracing()?;

    let config = Config::load(args.file.as_deref(), args.overrides())
        .context("invalid configuration")?;
    info!("config: {config:#?}");

    info!(
        "Logging metrics to {}/{} as {}{}",
        config.server_address,
        config.database_name,
        config.device_id,
        if config.dry_run { " (dry run)" } else { "" }
    );

    let sensor = Sensor::open(
        config.sensor_variant,
        &config.i2c_bus,
        config.switchbot_address,
    )
    .await
    .with_context(|| format!("failed to open {} sensor", config.sensor_variant.as_str()))?;

    let store = if config.dry_run {
        None
    } else {
        Some(StoreClient::connect(&config.store_settings())?)
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        }
    });

    let summary = pipeline::run(&config, sensor, store, shutdown).await?;
    info!(
        iterations = summary.iterations,
        undelivered = summary.undelivered,
        "all time deliveries: {}",
        summary.deliveries
    );

    Ok(())
}
