//! Opening byte streams to CONNECT targets, directly or through an upstream.

use crate::auth::CredentialInjector;
use crate::config::proxy_socket_target;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::HOST;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A connected stream to a tunnel target.
pub trait Tunnel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Tunnel for T {}

pub type TunnelStream = Box<dyn Tunnel>;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connecting to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("CONNECT handshake with upstream {upstream} failed: {source}")]
    Handshake {
        upstream: String,
        #[source]
        source: hyper::Error,
    },
    #[error("upstream {upstream} refused CONNECT {target}: {status}")]
    Refused {
        upstream: String,
        target: String,
        status: StatusCode,
    },
    #[error("invalid CONNECT target '{0}'")]
    InvalidTarget(String),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Open a plain TCP connection, bounded by `timeout`.
pub async fn connect_direct(addr: &str, timeout: Duration) -> Result<TcpStream, DialError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).ok();
            Ok(stream)
        }
        Ok(Err(source)) => Err(DialError::Connect {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(DialError::Timeout {
            addr: addr.to_string(),
            timeout,
        }),
    }
}

/// Ask the proxy at `upstream` to CONNECT to `target` and return the
/// established tunnel.
///
/// The credential hook is applied to the CONNECT request only; bytes sent
/// through the tunnel afterwards are untouched.
pub async fn connect_via_upstream(
    upstream: &Uri,
    target: &str,
    credentials: Option<&CredentialInjector>,
    timeout: Duration,
) -> Result<TunnelStream, DialError> {
    let proxy_addr = proxy_socket_target(upstream);
    let stream = connect_direct(&proxy_addr, timeout).await?;

    let handshake_error = |source| DialError::Handshake {
        upstream: proxy_addr.clone(),
        source,
    };

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .title_case_headers(true)
        .handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
        .await
        .map_err(handshake_error)?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Upstream CONNECT connection ended: {}", e);
        }
    });

    let authority: Uri = target
        .parse()
        .map_err(|_| DialError::InvalidTarget(target.to_string()))?;
    let mut req = Request::builder()
        .method(Method::CONNECT)
        .uri(authority)
        .header(HOST, target)
        .body(Empty::<Bytes>::new())
        .map_err(|_| DialError::InvalidTarget(target.to_string()))?;
    if let Some(injector) = credentials {
        injector.attach(&mut req);
    }

    let response = tokio::time::timeout(timeout, sender.send_request(req))
        .await
        .map_err(|_| DialError::Timeout {
            addr: proxy_addr.clone(),
            timeout,
        })?
        .map_err(handshake_error)?;

    if response.status() != StatusCode::OK {
        return Err(DialError::Refused {
            upstream: proxy_addr.clone(),
            target: target.to_string(),
            status: response.status(),
        });
    }

    let upgraded = hyper::upgrade::on(response)
        .await
        .map_err(handshake_error)?;
    debug!("Tunnel to {} established via {}", target, proxy_addr);
    Ok(Box::new(TokioIo::new(upgraded)))
}
