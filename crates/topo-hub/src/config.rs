use std::net::TcpListener;
use std::ops::RangeInclusive;

pub const AUTO_PORT_RANGE: RangeInclusive<u16> = 28080..=38080;
pub const FALLBACK_PORT: u16 = 28080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_LOG_DIR: &str = ".topo/logs";

pub fn resolve_port(host: &str, requested: u16) -> u16 {
    if requested == 0 {
        find_open_port(host)
    } else {
        requested
    }
}

pub fn find_open_port(host: &str) -> u16 {
    AUTO_PORT_RANGE
        .into_iter()
        .find(|port| is_port_open(host, *port))
        .unwrap_or(FALLBACK_PORT)
}

pub fn is_port_open(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|value| parse_bool(&value))
}

pub fn env_string(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

pub fn env_port(key: &str) -> Option<u16> {
    env_string(key).and_then(|value| value.parse::<u16>().ok())
}

pub fn resolve_log_dir(flag: &str, default: Option<&str>) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    if let Some(value) = env_string("TOPO_LOG_DIR") {
        return Some(value);
    }
    default.map(str::to_string)
}
