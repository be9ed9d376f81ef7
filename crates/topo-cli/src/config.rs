use clap::Parser;
use topo_hub::config::{parse_bool, resolve_log_dir, DEFAULT_LOG_DIR, FALLBACK_PORT};
use topo_core::protocol::WS_PATH;

#[derive(Parser, Debug, Default)]
#[command(name = "topo", about = "Topology hub with a live observer")]
pub struct Args {
    /// Do not start the embedded hub.
    #[arg(long, default_value_t = false)]
    pub no_server: bool,
    /// Do not start the observer.
    #[arg(long, default_value_t = false)]
    pub no_tui: bool,
    /// Hub port; 0 picks a free one.
    #[arg(long)]
    pub port: Option<u16>,
    /// Link the observer dials instead of the embedded hub.
    #[arg(long)]
    pub hub_url: Option<String>,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub server: bool,
    pub tui: bool,
    pub port: u16,
    pub hub_url: Option<String>,
    pub debug: bool,
    pub log_dir: Option<String>,
}

impl Config {
    pub fn resolve<F>(args: &Args, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_flag = |key: &str| env(key).and_then(|value| parse_bool(&value));
        let server = !args.no_server && env_flag("SERVER").unwrap_or(true);
        let tui = !args.no_tui && env_flag("TUI").unwrap_or(true);
        let port = args
            .port
            .or_else(|| env("PORT").and_then(|value| value.trim().parse().ok()))
            .unwrap_or(0);
        let hub_url = args
            .hub_url
            .clone()
            .or_else(|| env("TOPO_HUB_URL"))
            .filter(|value| !value.trim().is_empty());
        let debug = args.debug || env_flag("TOPO_DEBUG").unwrap_or(false);
        // The observer owns the terminal, so logs go to a file instead.
        let default_dir = tui.then_some(DEFAULT_LOG_DIR);
        let log_dir = resolve_log_dir(&args.log_dir, default_dir);
        Self {
            server,
            tui,
            port,
            hub_url,
            debug,
            log_dir,
        }
    }

    pub fn observer_link(&self, port: u16) -> String {
        if let Some(link) = &self.hub_url {
            return link.clone();
        }
        let port = if port == 0 { FALLBACK_PORT } else { port };
        format!("ws://127.0.0.1:{port}{WS_PATH}")
    }
}
