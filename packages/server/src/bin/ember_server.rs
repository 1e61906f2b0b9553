//! ember server entry point: parse config, start the engine thread, then
//! accept connections until a shutdown signal arrives (spec §4.D, §6).

use std::sync::Arc;

use clap::Parser as ClapParser;
use ember_server::config::{Cli, Config};
use ember_server::network::Listener;
use ember_server::Engine;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config_file {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Config::parse(&text)?
        }
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.daemonize = config.daemonize || cli.daemonize;

    let (engine, engine_thread) = Engine::spawn(config.clone())?;
    let mut listener = Listener::new(Arc::new(config));
    let port = listener.start().await?;
    info!(port, "ember server ready");

    let shutdown = listener.shutdown_controller();
    let engine_for_signal = engine.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown.trigger_shutdown();
        engine_for_signal.shutdown();
    });

    listener.serve(engine).await?;
    engine_thread.join().ok();
    Ok(())
}
