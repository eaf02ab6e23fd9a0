//! Admin listener for gateway liveness and metrics.
//!
//! Served on a separate port from proxied traffic so scrapes never compete
//! with the data plane: `/health` answers 200 while the process is up, and
//! `/metrics` exposes the Prometheus registry.

use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Admin HTTP listener.
pub struct AdminListener {
    tcp_listener: TcpListener,
    addr: SocketAddr,
}

impl AdminListener {
    /// Binds the admin endpoints to the specified address.
    pub async fn bind(addr: &str) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| GatewayError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        info!("admin endpoints bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            addr: local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves admin requests until a shutdown signal is received.
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(handle);
                                if let Err(e) =
                                    http1::Builder::new().serve_connection(io, service).await
                                {
                                    error!("admin connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept admin connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping admin listener");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle(req: Request<Incoming>) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/health" => text_response(StatusCode::OK, Bytes::from_static(b"ok")),
        "/metrics" => match Metrics::encode() {
            Ok(body) => text_response(StatusCode::OK, Bytes::from(body)),
            Err(e) => {
                error!("failed to encode metrics: {}", e);
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Bytes::from_static(b"metrics encoding failed"),
                )
            }
        },
        _ => text_response(StatusCode::NOT_FOUND, Bytes::from_static(b"not found")),
    };
    Ok(response)
}

fn text_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(body))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_bind() {
        let listener = AdminListener::bind("127.0.0.1:0").await;
        assert!(listener.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_health_and_metrics_endpoints() {
        use http_body_util::Empty;
        use hyper_util::client::legacy::Client;
        use hyper_util::rt::TokioExecutor;

        let listener = AdminListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(async move {
            let _ = listener.serve(shutdown_rx).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client: Client<_, Empty<Bytes>> =
            Client::builder(TokioExecutor::new()).build_http();

        let health = client
            .get(format!("http://{addr}/health").parse().unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        crate::metrics::Metrics::record_request("GET", 200, "svc", 1.0);
        let metrics = client
            .get(format!("http://{addr}/metrics").parse().unwrap())
            .await
            .unwrap();
        assert_eq!(metrics.status(), StatusCode::OK);
        let body = metrics.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("nexus_requests_total"));

        let missing = client
            .get(format!("http://{addr}/nope").parse().unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let _ = shutdown_tx.send(());
    }
}
