use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod describe;
mod engine;
mod speech;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "greeterd starting");

    let config = config::Config::load().context("failed to load configuration")?;
    let threshold = config.distance_threshold()?;

    let store = greeter_store::Store::open(&config.storage.db_path)
        .with_context(|| format!("failed to open store at {}", config.storage.db_path.display()))?;
    tracing::info!(path = %config.storage.db_path.display(), "store opened");

    let quit = Arc::new(AtomicBool::new(false));
    let frame_loop = engine::spawn_loop(
        &config,
        threshold,
        Arc::new(store),
        tokio::runtime::Handle::current(),
        quit.clone(),
    )
    .context("failed to start frame loop")?;

    tracing::info!("greeterd ready");

    let mut loop_done = tokio::task::spawn_blocking(move || frame_loop.join());

    let joined = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("greeterd shutting down");
            quit.store(true, Ordering::Relaxed);
            loop_done.await?
        }
        joined = &mut loop_done => joined?,
    };

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "frame loop failed");
            Err(e.into())
        }
        Err(_) => anyhow::bail!("frame loop panicked"),
    }
}
