//! The HTTP request handler.
//!
//! For each request: match a route, draw a backend from the service's
//! balancer, rewrite the URI to the backend origin, and stream the upstream
//! response back. Bodies are never buffered beyond what hyper does
//! internally. All failures collapse to the error handler, which by default
//! answers `503 Service Unavailable`.

use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use crate::router::Router;
use crate::service::{ConnectionGuard, Service as BackendService};
use crate::telemetry::TraceContext;
use http::header::CONNECTION;
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::Service;
use tracing::{debug, warn, Instrument};

/// Response body type produced by the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

type ErrorHandler = Arc<dyn Fn(&GatewayError) -> Response<ProxyBody> + Send + Sync>;

/// Reverse-proxy request handler.
///
/// Implements `tower::Service` so the listener can drive it per connection;
/// clones share the router and the upstream connection pool.
#[derive(Clone)]
pub struct Proxy {
    router: Arc<Router>,
    client: Client<TracedConnector, Incoming>,
    error_handler: Option<ErrorHandler>,
}

impl Proxy {
    pub fn new(router: Arc<Router>) -> Self {
        let connector = TracedConnector::new();
        Self {
            router,
            client: Client::builder(TokioExecutor::new()).build(connector),
            error_handler: None,
        }
    }

    /// Replaces the default `503 Service Unavailable` error response.
    pub fn set_error_handler<F>(&mut self, handler: F)
    where
        F: Fn(&GatewayError) -> Response<ProxyBody> + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
    }

    async fn forward(
        &self,
        service: Option<Arc<BackendService>>,
        mut req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>> {
        let service = service.ok_or_else(|| GatewayError::NoRoute {
            path: req.uri().path().to_string(),
        })?;

        let span = tracing::info_span!(
            "Proxy.Request",
            lb.strategy = %service.strategy(),
            backend.count = service.backend_count(),
        );

        // Selection is synchronous; entering the span here attaches the
        // balancer's `Selected backend` event to it.
        let target = span.in_scope(|| service.next_server())?;
        // The guard must exist before any fallible step: selection already
        // counted the backend, and an early return without it would leak a
        // least-connections slot.
        let guard = service.track(target.clone());

        let upstream_uri = build_upstream_uri(&target, req.uri())?;
        *req.uri_mut() = upstream_uri;

        strip_hop_by_hop_headers(req.headers_mut());
        let trace_ctx = TraceContext::from_headers(req.headers());
        trace_ctx.inject(req.headers_mut());

        let client = self.client.clone();

        async move {
            let response = client.request(req).await?;
            let (parts, body) = response.into_parts();
            // The guard rides along with the body so the connection slot is
            // released when the response finishes streaming (or the client
            // goes away).
            let body = TrackedBody {
                inner: body.boxed(),
                guard: Some(guard),
            }
            .boxed();
            Ok(Response::from_parts(parts, body))
        }
        .instrument(span)
        .await
    }

    fn error_response(&self, err: &GatewayError) -> Response<ProxyBody> {
        if let Some(handler) = &self.error_handler {
            return handler(err);
        }

        Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(full_body("Service unavailable"))
            .unwrap_or_else(|_| Response::new(full_body("Service unavailable")))
    }
}

impl Service<Request<Incoming>> for Proxy {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            Metrics::inc_requests_in_flight();
            let start = Instant::now();
            let method = req.method().to_string();

            let service = this.router.match_request(&req);
            let service_name = service.as_ref().map(|s| s.name()).unwrap_or_default();

            let response = match this.forward(service, req).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(error = %err, "proxy error");
                    this.error_response(&err)
                }
            };

            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            Metrics::record_request(
                &method,
                response.status().as_u16(),
                &service_name,
                latency_ms,
            );
            Metrics::dec_requests_in_flight();

            Ok(response)
        })
    }
}

/// Builds the absolute upstream URI from the backend origin and the request's
/// path and query.
fn build_upstream_uri(target: &str, original: &Uri) -> Result<Uri> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let uri: Uri = format!("{target}{path_and_query}").parse().map_err(
        |e: http::uri::InvalidUri| GatewayError::InvalidTargetUrl {
            url: target.to_string(),
            reason: e.to_string(),
        },
    )?;

    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(GatewayError::InvalidTargetUrl {
            url: target.to_string(),
            reason: "missing scheme or authority".to_string(),
        });
    }

    Ok(uri)
}

fn full_body(message: &'static str) -> ProxyBody {
    Full::new(Bytes::from_static(message.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

/// Headers scoped to a single connection, per the reverse-proxy contract.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers before forwarding: any header the request
/// names in its own `Connection` header, then the standard set.
fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let connection_named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();

    for name in connection_named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Connector wrapper that announces acquired upstream connections.
///
/// Pooled connections never re-enter the connector, so every event here is a
/// fresh connect (`reused = false`).
#[derive(Clone)]
struct TracedConnector {
    inner: HttpConnector,
}

impl TracedConnector {
    fn new() -> Self {
        Self {
            inner: HttpConnector::new(),
        }
    }
}

impl Service<Uri> for TracedConnector {
    type Response = <HttpConnector as Service<Uri>>::Response;
    type Error = Box<dyn std::error::Error + Send + Sync>;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map(|r| r.map_err(Into::into))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let remote = dst
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let fut = self.inner.call(dst);

        Box::pin(async move {
            let io = fut.await.map_err(|e| Into::<Box<dyn std::error::Error + Send + Sync>>::into(e))?;
            debug!(reused = false, remote = %remote, "Acquired connection");
            Ok(io)
        })
    }
}

/// Streams an upstream body while holding a [`ConnectionGuard`]; the guard is
/// dropped when the body ends, errors, or is abandoned, releasing the
/// backend's least-connections slot.
struct TrackedBody {
    inner: ProxyBody,
    guard: Option<ConnectionGuard>,
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(None) | Poll::Ready(Some(Err(_))) = &poll {
            this.guard.take();
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
