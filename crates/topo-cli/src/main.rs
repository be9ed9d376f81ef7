mod config;
mod observer;

use anyhow::Context;
use clap::Parser;
use config::{Args, Config};
use observer::Observer;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use topo_hub::{
    config::{resolve_port, DEFAULT_HOST},
    logging::{init_logging, LogConfig},
    launch, FixedMetrics, LaunchOptions, RunningHub,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::resolve(&args, |key| std::env::var(key).ok());
    let _log_guard = init_logging(&LogConfig {
        name: "cli".to_string(),
        debug: config.debug,
        log_dir: config.log_dir.clone(),
        stdout: !config.tui,
    });
    info!(
        event = "topo_start",
        server = config.server,
        tui = config.tui,
        port = config.port
    );
    if !config.server && !config.tui {
        info!(event = "topo_idle", reason = "server and tui disabled");
        return Ok(());
    }

    let hub = if config.server {
        Some(start_hub(config.port).await?)
    } else {
        None
    };
    let port = hub.as_ref().map(|hub| hub.addr.port()).unwrap_or(config.port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let observer = config.tui.then(|| {
        let link = config.observer_link(port);
        info!(event = "observer_start", link = %link);
        tokio::spawn(Observer::new(link).run(shutdown_rx))
    });

    let result = match observer {
        Some(mut observer) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!(event = "topo_signal", signal = "ctrl_c");
                    shutdown_tx.send_replace(true);
                    observer.await.context("observer task")?
                }
                joined = &mut observer => joined.context("observer task")?,
            }
        }
        None => {
            tokio::signal::ctrl_c().await.context("wait for ctrl_c")?;
            info!(event = "topo_signal", signal = "ctrl_c");
            Ok(())
        }
    };
    if let Err(err) = &result {
        error!(event = "observer_error", error = %err);
    }

    if let Some(hub) = hub {
        hub.shutdown().await.context("hub shutdown")?;
    }
    info!(event = "topo_stop");
    result
}

async fn start_hub(requested: u16) -> anyhow::Result<RunningHub> {
    let port = resolve_port(DEFAULT_HOST, requested);
    let addr: SocketAddr = format!("{DEFAULT_HOST}:{port}")
        .parse()
        .context("hub listen address")?;
    let hub = launch(LaunchOptions::new(addr, Arc::new(FixedMetrics::default())))
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(event = "hub_listening", url = %hub.url());
    Ok(hub)
}
