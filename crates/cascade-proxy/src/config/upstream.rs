//! Upstream proxy, health check and connection configuration.

use super::ConfigError;
use hyper::Uri;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const HTTP_PREFIX: &str = "http://";
const HTTPS_PREFIX: &str = "https://";

/// The cascade upstream and the credentials presented to it.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Upstream proxy address, with or without `http://` (empty = no cascade)
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
}

impl UpstreamConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty()
    }

    /// Parse the configured upstream.
    ///
    /// Returns `Ok(None)` when no upstream is set, and an error when one is set
    /// but can't be used.
    pub fn uri(&self) -> Result<Option<Uri>, ConfigError> {
        if !self.is_configured() {
            return Ok(None);
        }
        parse_proxy_uri(self.url.trim()).map(Some)
    }
}

/// Prefix `http://` unless the address is empty or already carries a scheme.
pub fn normalize_proxy_url(raw: &str) -> String {
    if raw.is_empty() || raw.starts_with(HTTP_PREFIX) || raw.starts_with(HTTPS_PREFIX) {
        raw.to_string()
    } else {
        format!("{HTTP_PREFIX}{raw}")
    }
}

/// Parse an upstream proxy address into a URI usable for dialing.
pub fn parse_proxy_uri(raw: &str) -> Result<Uri, ConfigError> {
    let normalized = normalize_proxy_url(raw);
    let uri: Uri = normalized
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ConfigError::InvalidProxyUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

    if uri.scheme_str() != Some("http") {
        return Err(ConfigError::InvalidProxyUrl {
            url: raw.to_string(),
            reason: "only http:// upstream proxies are supported".to_string(),
        });
    }
    if uri.host().map(str::is_empty).unwrap_or(true) {
        return Err(ConfigError::InvalidProxyUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(uri)
}

/// `host:port` to open a TCP connection to the proxy behind `uri`.
pub fn proxy_socket_target(uri: &Uri) -> String {
    let host = uri.host().unwrap_or_default();
    let port = uri.port_u16().unwrap_or(80);
    format!("{host}:{port}")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Address fetched to decide whether the internet is directly reachable
    #[serde(default = "default_health_address")]
    pub address: String,
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_seconds: u64,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Probe timeout, never longer than the interval between probes.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.min(self.interval_seconds).max(1))
    }
}

fn default_health_address() -> String {
    "https://www.google.com".to_string()
}

fn default_health_interval() -> u64 {
    5
}

fn default_health_timeout() -> u64 {
    5
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            address: default_health_address(),
            interval_seconds: default_health_interval(),
            timeout_seconds: default_health_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Grace period for in-flight requests when a server is replaced
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_drain_timeout() -> u64 {
    5
}
