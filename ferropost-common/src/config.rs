//! Environment-driven configuration.
//!
//! Every setting is read from the process environment on demand; there is
//! no configuration file. Parsing is split from the env lookup so the
//! parse rules can be tested without mutating process state.

use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use cidr::IpCidr;

const DEFAULT_HOSTNAME: &str = "localhost";
const DEFAULT_SMTP_PORT: &str = "2525";
const DEFAULT_BANNER: &str = "GopherPost ready";
const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_SPOOL_PATH: &str = "./data/spool";

/// Read a boolean environment variable. Only `true`/`false`
/// (case-insensitive) are recognised; anything else falls back to the
/// default.
pub fn bool_env(key: &str, default: bool) -> bool {
    parse_bool(env::var(key).as_deref().unwrap_or(""), default)
}

pub(crate) fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => true,
        "false" => false,
        _ => default,
    }
}

/// The identity this relay announces in its banner and EHLO replies.
/// Preference order: `SMTP_HOSTNAME`, the system hostname, `localhost`.
pub fn hostname() -> String {
    if let Ok(name) = env::var("SMTP_HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    let system = gethostname::gethostname().to_string_lossy().into_owned();
    if system.is_empty() {
        DEFAULT_HOSTNAME.to_string()
    } else {
        system
    }
}

/// Listen address for the SMTP front-end, `0.0.0.0:<SMTP_PORT>`.
pub fn smtp_addr() -> String {
    let port = env::var("SMTP_PORT").unwrap_or_default();
    let port = if port.is_empty() {
        DEFAULT_SMTP_PORT.to_string()
    } else {
        port
    };
    format!("0.0.0.0:{port}")
}

/// Banner text appended to the hostname in the `220` greeting.
pub fn banner() -> String {
    let banner = env::var("SMTP_BANNER").unwrap_or_default();
    if banner.is_empty() {
        DEFAULT_BANNER.to_string()
    } else {
        banner
    }
}

/// Spool base directory (`SMTP_QUEUE_PATH`).
pub fn spool_path() -> PathBuf {
    let path = env::var("SMTP_QUEUE_PATH").unwrap_or_default();
    let path = path.trim();
    if path.is_empty() {
        PathBuf::from(DEFAULT_SPOOL_PATH)
    } else {
        PathBuf::from(path)
    }
}

/// Number of concurrent delivery workers (`SMTP_QUEUE_WORKERS`).
/// Defaults to the number of logical CPUs when unset or invalid.
pub fn queue_workers() -> usize {
    parse_workers(env::var("SMTP_QUEUE_WORKERS").as_deref().unwrap_or(""))
}

pub(crate) fn parse_workers(value: &str) -> usize {
    match value.trim().parse::<usize>() {
        Ok(workers) if workers >= 1 => workers,
        _ => num_cpus::get().max(1),
    }
}

/// Whether the sender domain must equal the configured hostname
/// (`SMTP_REQUIRE_LOCAL_DOMAIN`, default on).
pub fn require_sender_domain() -> bool {
    bool_env("SMTP_REQUIRE_LOCAL_DOMAIN", true)
}

/// CIDR blocks from `SMTP_ALLOW_NETWORKS`. Bare IPs become host-length
/// prefixes; entries that fail to parse are skipped.
pub fn allowed_networks() -> Vec<IpCidr> {
    parse_networks(env::var("SMTP_ALLOW_NETWORKS").as_deref().unwrap_or(""))
}

pub(crate) fn parse_networks(value: &str) -> Vec<IpCidr> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            if part.contains('/') {
                IpCidr::from_str(part).ok()
            } else {
                let ip: IpAddr = part.parse().ok()?;
                let host_len = if ip.is_ipv4() { 32 } else { 128 };
                IpCidr::new(ip, host_len).ok()
            }
        })
        .collect()
}

/// Exact remote hosts from `SMTP_ALLOW_HOSTS`, lower-cased.
pub fn allowed_hosts() -> Vec<String> {
    parse_hosts(env::var("SMTP_ALLOW_HOSTS").as_deref().unwrap_or(""))
}

pub(crate) fn parse_hosts(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|part| part.trim().to_lowercase())
        .filter(|part| !part.is_empty())
        .collect()
}

/// Listen address for the health plane. `SMTP_HEALTH_ADDR` overrides the
/// whole address; `SMTP_HEALTH_PORT` overrides just the port.
pub fn health_addr() -> String {
    let mut addr = env::var("SMTP_HEALTH_ADDR").unwrap_or_default();
    if addr.is_empty() {
        addr = DEFAULT_HEALTH_ADDR.to_string();
    }
    if let Ok(port) = env::var("SMTP_HEALTH_PORT") {
        addr = override_port(&addr, &port);
    }
    addr
}

pub(crate) fn override_port(addr: &str, port: &str) -> String {
    let port = port.trim().trim_start_matches(':');
    if port.is_empty() {
        return addr.to_string();
    }
    match addr.rfind(':') {
        None => format!("{addr}:{port}"),
        Some(at) => format!("{}:{port}", &addr[..at]),
    }
}

pub fn health_disabled() -> bool {
    bool_env("SMTP_HEALTH_DISABLE", false)
}
