//! Proxy server module.
//!
//! The listening side of cascade-proxy: accepts client connections, opens
//! CONNECT tunnels through the [`DialSelector`](crate::routing::DialSelector)
//! and forwards plain HTTP requests according to the
//! [`ProxySelector`](crate::routing::ProxySelector).
//!
//! # Module Structure
//!
//! - `server` - ProxyServer, ServerHandle and the accept loop
//! - `handler` - CONNECT and plain request handling
//! - `forwarding` - Request forwarding to origins or upstream proxies
//! - `headers` - Hop-by-hop header stripping
//! - `network` - Listener setup (SO_REUSEADDR)

mod forwarding;
mod handler;
mod headers;
mod network;
mod server;

pub use forwarding::{error_response, ForwardError, ProxyBody};
pub use headers::HopByHopExt;
pub use server::{ProxyServer, ServerHandle};
