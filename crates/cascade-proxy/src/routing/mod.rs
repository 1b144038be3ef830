//! Host routing for cascade mode.
//!
//! - `table` - [`RoutingTable`] of host overrides, one regex per upstream
//! - `selector` - dial and proxy selection built on the table
//! - `tunnel` - direct and upstream (CONNECT) connection setup

mod selector;
mod table;
mod tunnel;

pub use selector::{DialSelector, ProxySelector, SelectError};
pub use table::{RouteDecision, RouteEntry, RouteError, RoutingTable};
pub use tunnel::{connect_direct, connect_via_upstream, DialError, Tunnel, TunnelStream};
