//! Per-request handling: CONNECT tunnels and plain HTTP forwarding.

use super::forwarding::{
    empty_body, error_response, forward_request, request_authority, ForwardError, ProxyBody,
};
use crate::metrics;
use crate::mode::ServerWiring;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::copy_bidirectional;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// State shared by every connection of one server instance.
#[derive(Clone)]
pub(crate) struct RequestHandlerContext {
    pub wiring: Arc<ServerWiring>,
    /// Tunnels are tracked with connections so shutdown can wait for them
    pub tasks: TaskTracker,
    pub shutdown: CancellationToken,
}

pub(crate) async fn handle_request(
    ctx: &RequestHandlerContext,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
    if req.method() == Method::CONNECT {
        Ok(handle_connect(ctx, req).await)
    } else {
        Ok(handle_forward(ctx, req).await)
    }
}

/// Dial first, then answer: 200 and splice on success, 503 otherwise.
async fn handle_connect(ctx: &RequestHandlerContext, req: Request<Incoming>) -> Response<ProxyBody> {
    let target = match req.uri().authority() {
        Some(authority) if authority.port().is_some() => authority.to_string(),
        _ => {
            return error_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
        }
    };

    let mut upstream = match ctx.wiring.dialer.dial(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("CONNECT {} failed: {}", target, e);
            return error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
        }
    };

    let shutdown = ctx.shutdown.clone();
    ctx.tasks.spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("CONNECT {} upgrade failed: {}", target, e);
                return;
            }
        };
        let mut client = TokioIo::new(upgraded);
        tokio::select! {
            result = copy_bidirectional(&mut client, &mut upstream) => match result {
                Ok((sent, received)) => {
                    debug!("Tunnel to {} closed ({} bytes out, {} bytes in)", target, sent, received)
                }
                Err(e) => debug!("Tunnel to {} closed: {}", target, e),
            },
            _ = shutdown.cancelled() => debug!("Closing tunnel to {} for shutdown", target),
        }
    });

    Response::new(empty_body())
}

async fn handle_forward(ctx: &RequestHandlerContext, req: Request<Incoming>) -> Response<ProxyBody> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    let authority = match request_authority(&req) {
        Ok(authority) => authority,
        Err(e) => return forward_failed(&method, &uri, "none", e),
    };
    // Match on `host[:port]`, the same text CONNECT targets are matched on.
    let upstream = match ctx.wiring.selector.select(authority.as_str()) {
        Ok(upstream) => upstream,
        Err(e) => return forward_failed(&method, &uri, "upstream", e.into()),
    };
    let route = if upstream.is_some() { "upstream" } else { "direct" };

    match forward_request(
        req,
        &authority,
        upstream.as_ref(),
        ctx.wiring.credentials.as_ref(),
        ctx.wiring.connect_timeout,
    )
    .await
    {
        Ok(response) => {
            debug!("{} {} -> {} ({})", method, uri, response.status(), route);
            metrics::record_forward(route, response.status());
            response
        }
        Err(e) => forward_failed(&method, &uri, route, e),
    }
}

fn forward_failed(method: &Method, uri: &Uri, route: &str, error: ForwardError) -> Response<ProxyBody> {
    let status = error.status();
    warn!("{} {} failed: {}", method, uri, error);
    metrics::record_forward(route, status);
    error_response(status, &error.to_string())
}
