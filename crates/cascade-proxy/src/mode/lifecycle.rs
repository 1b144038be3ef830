use super::Mode;
use crate::auth::CredentialInjector;
use crate::routing::{DialSelector, ProxySelector};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

/// Everything a proxy server needs to serve one mode.
#[derive(Clone, Debug)]
pub struct ServerWiring {
    pub mode: Mode,
    pub dialer: DialSelector,
    pub selector: ProxySelector,
    /// Only set in cascade mode; never sent to origin servers
    pub credentials: Option<CredentialInjector>,
    pub connect_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Starts and stops the listening proxy server.
#[async_trait]
pub trait ServerLifecycle: Send + Sync {
    type Handle: Send;

    async fn start(&self, wiring: ServerWiring) -> Result<Self::Handle, ServerError>;

    /// Must release the listening port before returning.
    async fn shutdown(&self, handle: Self::Handle);
}
