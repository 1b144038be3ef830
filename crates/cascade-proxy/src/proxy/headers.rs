//! Hop-by-hop header handling.
//!
//! These headers describe a single connection and must not travel past the
//! proxy. `Proxy-Authorization` is among them, so credentials a client sent
//! to us never reach the next hop unless we attach our own.

use hyper::header::{
    HeaderMap, HeaderName, CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};

pub static KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
pub static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Extension trait for stripping connection-scoped headers.
pub trait HopByHopExt {
    fn strip_hop_by_hop(&mut self);
}

impl HopByHopExt for HeaderMap {
    fn strip_hop_by_hop(&mut self) {
        // Headers listed in `Connection` are hop-by-hop as well.
        let listed: Vec<HeaderName> = self
            .get_all(CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
            .collect();
        for name in listed {
            self.remove(name);
        }

        for name in [
            CONNECTION,
            PROXY_AUTHENTICATE,
            PROXY_AUTHORIZATION,
            TE,
            TRAILER,
            TRANSFER_ENCODING,
            UPGRADE,
        ] {
            self.remove(name);
        }
        self.remove(&KEEP_ALIVE);
        self.remove(&PROXY_CONNECTION);
    }
}
