use std::time::Duration;

use tracing::warn;
use vitrine_ca::CaConfig;

use crate::errors::ProxyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    pub timeouts: ServerTimeouts,
    pub transport: TransportConfig,
    pub cache: CacheSettings,
    pub body: BodyConfig,
    pub ca: CaConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerTimeouts {
    pub read_header: Duration,
    pub read_body: Duration,
    pub write: Duration,
    pub idle: Duration,
    pub max_header_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    pub max_conns_per_host: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub request_timeout: Duration,
    pub verify_upstream_tls: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// Soft size budget in bytes; 0 disables the cache entirely.
    pub max_size_bytes: u64,
    pub default_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyConfig {
    pub max_request_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 8080,
            timeouts: ServerTimeouts::default(),
            transport: TransportConfig::default(),
            cache: CacheSettings::default(),
            body: BodyConfig::default(),
            ca: CaConfig::default(),
        }
    }
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            read_header: Duration::from_secs(10),
            read_body: Duration::from_secs(30),
            write: Duration::from_secs(30),
            idle: Duration::from_secs(120),
            max_header_bytes: 1024 * 1024,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: 1000,
            max_idle_conns_per_host: 100,
            max_conns_per_host: 100,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(30),
            tcp_keepalive: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            verify_upstream_tls: true,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size_bytes: vitrine_cache::DEFAULT_MAX_SIZE,
            default_ttl: vitrine_cache::DEFAULT_MAX_AGE,
        }
    }
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self {
            max_request_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ProxyConfig {
    /// Defaults overridden by the recognized environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Environment overrides through an injectable lookup, so tests can
    /// feed variables without touching the process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("PROXY_PORT") {
            match value.parse::<u16>() {
                Ok(port) => self.listen_port = port,
                Err(_) => warn!(%value, "ignoring unparseable PROXY_PORT"),
            }
        }
        if let Some(value) = env_usize(&lookup, "MAX_IDLE_CONNS") {
            self.transport.max_idle_conns = value;
        }
        if let Some(value) = env_usize(&lookup, "MAX_IDLE_CONNS_PER_HOST") {
            self.transport.max_idle_conns_per_host = value;
        }
        if let Some(value) = env_usize(&lookup, "MAX_CONNS_PER_HOST") {
            self.transport.max_conns_per_host = value;
        }
        if let Some(value) = lookup("CACHE_SIZE_MB") {
            match value.parse::<u64>() {
                Ok(megabytes) => self.cache.max_size_bytes = megabytes * 1024 * 1024,
                Err(_) => warn!(%value, "ignoring unparseable CACHE_SIZE_MB"),
            }
        }
        if let Some(value) = lookup("CACHE_MAX_AGE") {
            match parse_duration(&value) {
                Some(ttl) => self.cache.default_ttl = ttl,
                None => warn!(%value, "ignoring unparseable CACHE_MAX_AGE"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ProxyError::InvalidConfig(
                "listen_addr must not be empty".to_string(),
            ));
        }
        if self.timeouts.max_header_bytes == 0 {
            return Err(ProxyError::InvalidConfig(
                "timeouts.max_header_bytes must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("timeouts.read_header", self.timeouts.read_header),
            ("timeouts.read_body", self.timeouts.read_body),
            ("timeouts.write", self.timeouts.write),
            ("timeouts.idle", self.timeouts.idle),
            ("transport.connect_timeout", self.transport.connect_timeout),
            ("transport.request_timeout", self.transport.request_timeout),
        ] {
            if value.is_zero() {
                return Err(ProxyError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.transport.max_conns_per_host == 0 {
            return Err(ProxyError::InvalidConfig(
                "transport.max_conns_per_host must be greater than zero".to_string(),
            ));
        }
        if self.body.max_request_body_bytes == 0 {
            return Err(ProxyError::InvalidConfig(
                "body.max_request_body_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<usize> {
    let value = lookup(name)?;
    match value.parse::<usize>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(name, %value, "ignoring unparseable environment override");
            None
        }
    }
}

/// Parses Go-style duration forms: `300ms`, `30s`, `5m`, `2h`, plus a
/// bare integer meaning seconds.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(seconds) = text.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let split = text.find(|c: char| !c.is_ascii_digit())?;
    let (number, unit) = text.split_at(split);
    let number = number.parse::<u64>().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(number)),
        "s" => Some(Duration::from_secs(number)),
        "m" => Some(Duration::from_secs(number * 60)),
        "h" => Some(Duration::from_secs(number * 60 * 60)),
        _ => None,
    }
}
