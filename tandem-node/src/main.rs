// Tandem daemon: listener plus stdin command driver.

use std::sync::Arc;

use anyhow::Context;
use tandem_node::{config, driver, Engine, LogCollaborator};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("tandem-node {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();

    let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
    rt.block_on(async {
        let engine = Engine::start(cfg, Arc::new(LogCollaborator))
            .await
            .context("starting engine")?;
        let input = BufReader::new(tokio::io::stdin());
        let result = tokio::select! {
            r = driver::run(&engine, input) => r,
            r = shutdown_signal() => r,
        };
        engine.shutdown().await;
        result
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutdown signal received");
    Ok(())
}
