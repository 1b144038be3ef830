//! Plain HTTP forwarding, either to the origin or through an upstream proxy.

use super::headers::HopByHopExt;
use crate::auth::CredentialInjector;
use crate::config::proxy_socket_target;
use crate::routing::{connect_direct, DialError, SelectError};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::http::uri::Authority;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tracing::debug;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("request has no target host")]
    MissingHost,
    #[error("unsupported scheme '{0}', use CONNECT")]
    UnsupportedScheme(String),
    #[error("invalid request target: {0}")]
    InvalidTarget(#[from] hyper::http::Error),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("exchange with {addr} failed: {source}")]
    Exchange {
        addr: String,
        #[source]
        source: hyper::Error,
    },
}

impl ForwardError {
    /// Status reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::MissingHost
            | ForwardError::UnsupportedScheme(_)
            | ForwardError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ForwardError::Select(_) | ForwardError::Exchange { .. } => StatusCode::BAD_GATEWAY,
            ForwardError::Dial(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Helper function to create an error response.
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{message}\n")))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Where a proxied request is headed: absolute-form URI first, `Host` second.
pub fn request_authority<B>(req: &Request<B>) -> Result<Authority, ForwardError> {
    if let Some(scheme) = req.uri().scheme_str() {
        if scheme != "http" {
            return Err(ForwardError::UnsupportedScheme(scheme.to_string()));
        }
    }
    if let Some(authority) = req.uri().authority() {
        return Ok(authority.clone());
    }
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<Authority>().ok())
        .ok_or(ForwardError::MissingHost)
}

/// Send `req` on and return the response with hop-by-hop headers removed.
///
/// With an upstream the request keeps its absolute form and gets the proxy
/// credentials; without one it's rewritten to origin form and sent to
/// `authority` directly.
pub async fn forward_request(
    req: Request<Incoming>,
    authority: &Authority,
    upstream: Option<&Uri>,
    credentials: Option<&CredentialInjector>,
    connect_timeout: Duration,
) -> Result<Response<ProxyBody>, ForwardError> {
    let (mut parts, body) = req.into_parts();
    parts.headers.strip_hop_by_hop();
    if !parts.headers.contains_key(HOST) {
        if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
            parts.headers.insert(HOST, host);
        }
    }

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let addr = match upstream {
        Some(proxy) => {
            parts.uri = Uri::builder()
                .scheme("http")
                .authority(authority.as_str())
                .path_and_query(path.as_str())
                .build()?;
            proxy_socket_target(proxy)
        }
        None => {
            parts.uri = Uri::builder().path_and_query(path.as_str()).build()?;
            format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80))
        }
    };

    let mut req = Request::from_parts(parts, body);
    if upstream.is_some() {
        if let Some(injector) = credentials {
            injector.attach(&mut req);
        }
    }

    debug!("Forwarding {} {} via {}", req.method(), req.uri(), addr);
    let stream = connect_direct(&addr, connect_timeout).await?;
    let exchange_error = |source| ForwardError::Exchange {
        addr: addr.clone(),
        source,
    };

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .handshake::<_, Incoming>(TokioIo::new(stream))
        .await
        .map_err(exchange_error)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Outbound connection ended: {}", e);
        }
    });

    let response = sender.send_request(req).await.map_err(exchange_error)?;
    let (mut parts, body) = response.into_parts();
    parts.headers.strip_hop_by_hop();
    Ok(Response::from_parts(parts, body.boxed()))
}
