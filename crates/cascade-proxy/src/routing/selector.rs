//! Per-mode routing decisions handed to the proxy server.
//!
//! [`DialSelector`] answers CONNECT requests with an open stream;
//! [`ProxySelector`] answers plain HTTP requests with the upstream to send
//! them through. Both follow the same three-way rule: an override with no
//! upstream goes direct, an override with an upstream goes there, and
//! everything else goes to the default cascade upstream.

use super::table::{RouteDecision, RoutingTable};
use super::tunnel::{connect_direct, connect_via_upstream, DialError, TunnelStream};
use crate::auth::CredentialInjector;
use crate::config::{parse_proxy_uri, ConfigError};
use crate::metrics;
use hyper::Uri;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Debug)]
struct CascadeRoute {
    table: Arc<RoutingTable>,
    default_upstream: Uri,
}

impl CascadeRoute {
    fn resolve(&self, target: &str) -> Result<Option<Uri>, ConfigError> {
        match self.table.decide(target) {
            RouteDecision::Direct => Ok(None),
            RouteDecision::Upstream(url) => parse_proxy_uri(&url).map(Some),
            RouteDecision::Default => Ok(Some(self.default_upstream.clone())),
        }
    }
}

/// Opens connections for CONNECT tunnels.
#[derive(Clone, Debug)]
pub struct DialSelector {
    cascade: Option<CascadeRoute>,
    credentials: Option<CredentialInjector>,
    connect_timeout: Duration,
}

impl DialSelector {
    /// Every target is dialed directly.
    pub fn direct(connect_timeout: Duration) -> Self {
        Self {
            cascade: None,
            credentials: None,
            connect_timeout,
        }
    }

    pub fn cascade(
        table: Arc<RoutingTable>,
        default_upstream: Uri,
        credentials: Option<CredentialInjector>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            cascade: Some(CascadeRoute {
                table,
                default_upstream,
            }),
            credentials,
            connect_timeout,
        }
    }

    /// Connect to `target` (`host:port` as given in the CONNECT request).
    pub async fn dial(&self, target: &str) -> Result<TunnelStream, DialError> {
        let upstream = match self.cascade {
            Some(ref cascade) => cascade.resolve(target)?,
            None => None,
        };

        let result = match upstream {
            Some(ref upstream) => {
                debug!("Dialing {} via {}", target, upstream);
                connect_via_upstream(
                    upstream,
                    target,
                    self.credentials.as_ref(),
                    self.connect_timeout,
                )
                .await
            }
            None => {
                debug!("Dialing {} directly", target);
                connect_direct(target, self.connect_timeout)
                    .await
                    .map(|stream| Box::new(stream) as TunnelStream)
            }
        };

        let route = if upstream.is_some() { "upstream" } else { "direct" };
        metrics::record_dial(route, result.is_ok());
        result
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no usable upstream for {host}: {source}")]
pub struct SelectError {
    pub host: String,
    #[source]
    pub source: ConfigError,
}

/// Chooses the upstream for plain (non-CONNECT) HTTP requests.
#[derive(Clone, Debug)]
pub struct ProxySelector {
    cascade: Option<CascadeRoute>,
}

impl ProxySelector {
    pub fn direct() -> Self {
        Self { cascade: None }
    }

    pub fn cascade(table: Arc<RoutingTable>, default_upstream: Uri) -> Self {
        Self {
            cascade: Some(CascadeRoute {
                table,
                default_upstream,
            }),
        }
    }

    /// `Ok(None)` means send the request straight to the origin.
    pub fn select(&self, host: &str) -> Result<Option<Uri>, SelectError> {
        match self.cascade {
            Some(ref cascade) => cascade.resolve(host).map_err(|source| SelectError {
                host: host.to_string(),
                source,
            }),
            None => Ok(None),
        }
    }
}
