//! Configuration management
//!
//! JSON configuration overlaid onto a compiled-in default, mirroring
//! `original_source/config/config.go`'s `DefaultConfig` + `Data` overlay
//! pattern: every field is optional in the file and on the CLI, unknown
//! keys are rejected, and missing keys fall back to the default.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Effective, fully-resolved configuration. Immutable after startup; the
/// supervisor and every component below it are handed a `&Config` (or a
/// clone of the cheap fields) rather than re-reading the file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub tun_name: String,
    pub tun_ip: Ipv4Addr,
    pub tun_prefix: u8,
    pub tun_ip6: Option<std::net::Ipv6Addr>,
    pub tun_prefix6: u8,
    pub socks5_address: String,
    pub username: String,
    pub password: String,
    pub fake_dns: bool,
    pub fake_network: Ipv4Addr,
    pub fake_prefix: u8,
    pub dns_server: Ipv4Addr,
    pub udp_session_timeout: Duration,

    // Ambient-stack keys: logging/metrics are ambient concerns, carried
    // regardless of which features are in or out of scope.
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_bind_addr: std::net::SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tun_name: "tun0".to_string(),
            tun_ip: Ipv4Addr::new(10, 0, 0, 1),
            tun_prefix: 32,
            tun_ip6: None,
            tun_prefix6: 128,
            socks5_address: "127.0.0.1:1080".to_string(),
            username: String::new(),
            password: String::new(),
            fake_dns: true,
            fake_network: Ipv4Addr::new(240, 0, 0, 0),
            fake_prefix: 4,
            dns_server: Ipv4Addr::new(9, 9, 9, 9),
            udp_session_timeout: Duration::from_secs(60),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_bind_addr: "127.0.0.1:9090".parse().unwrap(),
        }
    }
}

/// JSON overlay: every field optional, `deny_unknown_fields` so a typo in
/// the config file is a startup error rather than a silently ignored key.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverlay {
    pub tun_name: Option<String>,
    pub tun_ip: Option<String>,
    pub tun_ip6: Option<String>,
    pub socks5_address: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub fake_dns: Option<bool>,
    pub fake_network: Option<String>,
    pub dns_server: Option<String>,
    pub udp_session_timeout: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
}

impl Config {
    /// Load the compiled-in default, then apply the JSON file at `path` if
    /// it exists. A missing file is not an error (mirrors the CLI's `-c`
    /// being optional); a present-but-malformed file is.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let overlay: ConfigOverlay =
                serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
            cfg.apply(overlay)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply a parsed overlay on top of the current values, validating each
    /// present field as it is merged (mirrors `Config.Update` in the
    /// original: CIDR parsing happens here, not at validation time).
    pub fn apply(&mut self, data: ConfigOverlay) -> Result<(), ConfigError> {
        if let Some(v) = data.tun_name {
            if v.is_empty() {
                return Err(ConfigError::Invalid("tun_name must not be empty".into()));
            }
            self.tun_name = v;
        }
        if let Some(v) = data.tun_ip {
            let (ip, prefix) = parse_ipv4_cidr(&v)?;
            self.tun_ip = ip;
            self.tun_prefix = prefix;
        }
        if let Some(v) = data.tun_ip6 {
            let (ip, prefix) = parse_ipv6_cidr(&v)?;
            self.tun_ip6 = Some(ip);
            self.tun_prefix6 = prefix;
        }
        if let Some(v) = data.socks5_address {
            if v.is_empty() {
                return Err(ConfigError::Invalid("socks5_address must not be empty".into()));
            }
            self.socks5_address = v;
        }
        if let Some(v) = data.username {
            self.username = v;
        }
        if let Some(v) = data.password {
            self.password = v;
        }
        if let Some(v) = data.fake_dns {
            self.fake_dns = v;
        }
        if let Some(v) = data.fake_network {
            let (ip, prefix) = parse_ipv4_cidr(&v)?;
            self.fake_network = ip;
            self.fake_prefix = prefix;
        }
        if let Some(v) = data.dns_server {
            self.dns_server = v
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid dns_server: {v}")))?;
        }
        if let Some(v) = data.udp_session_timeout {
            self.udp_session_timeout = parse_duration(&v)?;
        }
        if let Some(v) = data.log_level {
            self.log_level = v;
        }
        if let Some(v) = data.log_format {
            self.log_format = v;
        }
        if let Some(v) = data.metrics_enabled {
            self.metrics_enabled = v;
        }
        if let Some(v) = data.metrics_bind_addr {
            self.metrics_bind_addr = v
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid metrics_bind_addr: {v}")))?;
        }
        Ok(())
    }

    /// Express every field as a `ConfigOverlay`, in the same string shape
    /// `apply` parses back, so that `load(save(cfg)) == cfg` on every field.
    pub fn to_overlay(&self) -> ConfigOverlay {
        ConfigOverlay {
            tun_name: Some(self.tun_name.clone()),
            tun_ip: Some(format!("{}/{}", self.tun_ip, self.tun_prefix)),
            tun_ip6: self
                .tun_ip6
                .map(|ip| format!("{}/{}", ip, self.tun_prefix6)),
            socks5_address: Some(self.socks5_address.clone()),
            username: Some(self.username.clone()),
            password: Some(self.password.clone()),
            fake_dns: Some(self.fake_dns),
            fake_network: Some(format!("{}/{}", self.fake_network, self.fake_prefix)),
            dns_server: Some(self.dns_server.to_string()),
            udp_session_timeout: Some(format!("{}ms", self.udp_session_timeout.as_secs_f64() * 1000.0)),
            log_level: Some(self.log_level.clone()),
            log_format: Some(self.log_format.clone()),
            metrics_enabled: Some(self.metrics_enabled),
            metrics_bind_addr: Some(self.metrics_bind_addr.to_string()),
        }
    }

    /// Serialize this config to JSON at `path`, in the overlay shape `load`
    /// reads back.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(&self.to_overlay()).map_err(|source| {
            ConfigError::Parse { path: path.display().to_string(), source }
        })?;
        std::fs::write(path, json).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fake_prefix > 31 {
            return Err(ConfigError::Invalid(
                "fake_network prefix must be at most /31 (at least 2 host addresses)".into(),
            ));
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::Invalid(format!(
                "log_format must be \"json\" or \"pretty\", got {:?}",
                self.log_format
            )));
        }
        Ok(())
    }
}

fn parse_ipv4_cidr(s: &str) -> Result<(Ipv4Addr, u8), ConfigError> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| ConfigError::Invalid(format!("not in CIDR form: {s}")))?;
    let ip: Ipv4Addr = addr
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid IPv4 address: {addr}")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid prefix length: {prefix}")))?;
    if prefix > 32 {
        return Err(ConfigError::Invalid(format!("prefix length out of range: {prefix}")));
    }
    Ok((ip, prefix))
}

fn parse_ipv6_cidr(s: &str) -> Result<(std::net::Ipv6Addr, u8), ConfigError> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| ConfigError::Invalid(format!("not in CIDR form: {s}")))?;
    let ip: std::net::Ipv6Addr = addr
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid IPv6 address: {addr}")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid prefix length: {prefix}")))?;
    if prefix > 128 {
        return Err(ConfigError::Invalid(format!("prefix length out of range: {prefix}")));
    }
    Ok((ip, prefix))
}

/// Accepts plain seconds (`"60"`) or a Go-style duration suffix (`"60s"`,
/// `"2m"`) since the CLI flag is documented against the original's
/// `time.Duration` flag grammar.
fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let split_at = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split_at);
    let value: f64 = num
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid duration: {s}")))?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "ms" => value / 1000.0,
        other => return Err(ConfigError::Invalid(format!("unsupported duration unit: {other}"))),
    };
    Ok(Duration::from_secs_f64(secs))
}
