use anyhow::Context;
use crate::delay::{DEFAULT_GRACE, DEFAULT_WINDOW};
use crate::forwarder::DEFAULT_TIMEOUT;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Names that are always throttled regardless of the soft blocklists.
pub const DEFAULT_THROTTLED: [&str; 3] = ["reddit", "news.ycombinator.com", "instagram"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen_ip: IpAddr,
    pub port: u16,

    /// Port of the Prometheus endpoint; 0 turns it off.
    pub metrics_port: u16,

    /// Upstream resolvers: IPs or hostnames, with an optional `:port`.
    pub upstreams: Vec<String>,

    pub blocklists: BlocklistsConfig,
    pub throttle: ThrottleConfig,
    pub proxy: ProxyConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BlocklistsConfig {
    pub soft: Vec<String>,
    pub hard: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub window_ms: u64,
    pub grace_ms: u64,
    /// TTL forced onto replies released by the slow path.
    pub slow_ttl: u32,
    pub substrings: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8053,
            metrics_port: 8081,
            upstreams: Vec::new(),
            blocklists: BlocklistsConfig::default(),
            throttle: ThrottleConfig::default(),
            proxy: ProxyConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW.as_millis() as u64,
            grace_ms: DEFAULT_GRACE.as_millis() as u64,
            slow_ttl: 5,
            substrings: DEFAULT_THROTTLED.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ThrottleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AppConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&s)?)
    }

    /// Reads the optional TOML file, then applies the process environment.
    pub fn from_sources(path: Option<&str>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::load(p).with_context(|| format!("no pude leer config: {p}"))?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Overrides fields from `IP`, `PORT`, `METRICS_PORT`, `DNS_SERVERS`,
    /// `SOFT_BLOCK_LISTS` and `HARD_BLOCK_LISTS`. Lists are comma separated.
    pub fn apply_env<F>(&mut self, var: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ip) = var("IP") {
            self.listen_ip = ip.parse().with_context(|| format!("IP inválida: {ip}"))?;
        }
        if let Some(port) = var("PORT") {
            self.port = port.parse().with_context(|| format!("PORT inválido: {port}"))?;
        }
        if let Some(port) = var("METRICS_PORT") {
            self.metrics_port = port
                .parse()
                .with_context(|| format!("METRICS_PORT inválido: {port}"))?;
        }
        if let Some(v) = var("DNS_SERVERS") {
            self.upstreams = split_list(&v);
        }
        if let Some(v) = var("SOFT_BLOCK_LISTS") {
            self.blocklists.soft = split_list(&v);
        }
        if let Some(v) = var("HARD_BLOCK_LISTS") {
            self.blocklists.hard = split_list(&v);
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.port)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        (self.metrics_port != 0).then(|| SocketAddr::new(self.listen_ip, self.metrics_port))
    }

    /// Where a local health probe should send its query.
    pub fn probe_addr(&self) -> SocketAddr {
        let ip = match self.listen_ip {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, self.port)
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(str::to_string)
        .collect()
}
