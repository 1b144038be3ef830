//! Configuration types for the cascade proxy.

mod listen;
mod routing;
mod upstream;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use listen::{ListenConfig, MetricsConfig};
pub use routing::{parse_rule_list, parse_rules, RoutingRule, RuleParseError};
pub use upstream::{
    normalize_proxy_url, parse_proxy_uri, proxy_socket_target, ConnectionConfig,
    HealthCheckConfig, UpstreamConfig,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid upstream proxy url '{url}': {reason}")]
    InvalidProxyUrl { url: String, reason: String },
}

/// Process configuration. Built once at startup and shared read-only.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,

    /// Cascade upstream; leave `url` empty to run direct-only
    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Override rules in `host` or `host->upstream` form
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_overrides: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,

    #[serde(default)]
    pub verbose: bool,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    ///
    /// An unusable upstream URL is deliberately not rejected here: the mode
    /// controller logs it and stays direct.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.health_check.interval_seconds == 0 {
            anyhow::bail!("health_check.interval_seconds must be greater than zero");
        }
        if self.health_check.address.trim().is_empty() {
            anyhow::bail!("health_check.address must not be empty");
        }
        if self.connection.connect_timeout_secs == 0 {
            anyhow::bail!("connection.connect_timeout_secs must be greater than zero");
        }
        if let Some(ref metrics) = self.metrics {
            if metrics.port != 0 && metrics.port == self.listen.port {
                anyhow::bail!(
                    "metrics port {} collides with the proxy listen port",
                    metrics.port
                );
            }
        }
        Ok(())
    }

    /// Parsed host override rules. Malformed entries are logged and skipped.
    pub fn routing_rules(&self) -> Vec<RoutingRule> {
        let (rules, errors) = parse_rules(self.host_overrides.iter().map(String::as_str));
        for error in errors {
            warn!("Ignoring host override: {}", error);
        }
        rules
    }
}
