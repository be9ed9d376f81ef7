use anyhow::Context;
use clap::Parser;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use topo_hub::{
    config::{env_bool, env_port, env_string, resolve_log_dir, resolve_port, DEFAULT_HOST},
    logging::{init_logging, LogConfig},
    launch, FixedMetrics, LaunchOptions,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "topo-hub", about = "Topology state hub")]
struct Args {
    /// Port to listen on; 0 picks the first free port in 28080..=38080.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value = "")]
    host: String,
    /// Seconds between hub pings; 0 disables them.
    #[arg(long, default_value_t = 20)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    /// Seconds between metrics snapshots; 0 disables the sampler.
    #[arg(long, default_value_t = 5)]
    metrics_interval: u64,
    /// Accept upgrades without an X-Client-Id header.
    #[arg(long, default_value_t = false)]
    allow_anonymous: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let debug = args.debug || env_bool("TOPO_DEBUG").unwrap_or(false);
    let _log_guard = init_logging(&LogConfig {
        name: "hub".to_string(),
        debug,
        log_dir: resolve_log_dir(&args.log_dir, None),
        stdout: true,
    });

    let host = if args.host.trim().is_empty() {
        env_string("TOPO_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string())
    } else {
        args.host.clone()
    };
    let requested = args.port.or_else(|| env_port("PORT")).unwrap_or(0);
    let port = resolve_port(&host, requested);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    let mut options = LaunchOptions::new(addr, Arc::new(FixedMetrics::default()));
    options.server.require_identity = !args.allow_anonymous;
    options.server.ping_interval = Duration::from_secs(args.ping_interval);
    options.server.write_timeout = Duration::from_secs(args.write_timeout.max(1));
    options.metrics_interval =
        (args.metrics_interval > 0).then(|| Duration::from_secs(args.metrics_interval));

    let mut hub = launch(options)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(event = "hub_listening", url = %hub.url());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(event = "hub_signal", signal = "ctrl_c");
        }
        result = hub.wait() => {
            if let Err(err) = result {
                error!(event = "hub_error", error = %err);
                return Err(err.into());
            }
            return Ok(());
        }
    }
    hub.shutdown().await?;
    info!(event = "hub_stop");
    Ok(())
}
