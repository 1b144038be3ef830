//! Forwarding HTTP proxy that fails over between connecting directly and
//! cascading through an upstream proxy.

pub mod auth;
pub mod config;
pub mod metrics;
pub mod mode;
pub mod proxy;
pub mod routing;

#[cfg(test)]
mod test_support;

pub use auth::CredentialInjector;
pub use config::Config;
pub use mode::{Mode, ModeController};
pub use proxy::ProxyServer;
pub use routing::RoutingTable;
