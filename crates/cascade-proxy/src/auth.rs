//! Proxy credentials for the cascade upstream.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::{HeaderValue, PROXY_AUTHORIZATION};
use hyper::Request;

use crate::config::UpstreamConfig;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("proxy credentials can't be encoded as a header value")]
    InvalidHeader(#[from] hyper::header::InvalidHeaderValue),
}

/// Stamps `Proxy-Authorization: Basic ...` onto requests bound for an upstream.
///
/// Built once from configuration. Attaching replaces any existing header, so
/// applying it twice to the same request leaves a single value.
#[derive(Clone, Debug)]
pub struct CredentialInjector {
    header: HeaderValue,
}

impl CredentialInjector {
    /// Returns `None` when no username is configured.
    pub fn new(username: &str, password: &str) -> Result<Option<Self>, AuthError> {
        if username.is_empty() {
            return Ok(None);
        }
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        let mut header = HeaderValue::from_str(&format!("Basic {encoded}"))?;
        header.set_sensitive(true);
        Ok(Some(Self { header }))
    }

    pub fn from_config(upstream: &UpstreamConfig) -> Result<Option<Self>, AuthError> {
        Self::new(&upstream.username, &upstream.password)
    }

    pub fn attach<B>(&self, req: &mut Request<B>) {
        req.headers_mut()
            .insert(PROXY_AUTHORIZATION, self.header.clone());
    }

    pub fn header_value(&self) -> &HeaderValue {
        &self.header
    }
}
