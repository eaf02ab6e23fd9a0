//! TCP listener with graceful shutdown support.

use crate::error::{GatewayError, Result};
use crate::proxy::Proxy;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{error, info, warn};

/// HTTP listener that accepts connections and spawns handler tasks.
///
/// Connections are served with protocol auto-detection, so both HTTP/1.1 and
/// HTTP/2 (prior-knowledge) clients are accepted. Supports graceful shutdown
/// via a broadcast channel.
pub struct Listener {
    tcp_listener: TcpListener,
    proxy: Proxy,
    addr: SocketAddr,
}

impl Listener {
    /// Binds to the specified address.
    ///
    /// A leading-colon address like `":8080"` binds all interfaces.
    pub async fn bind(addr: &str, proxy: Proxy) -> Result<Self> {
        let normalized = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let tcp_listener =
            TcpListener::bind(&normalized)
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

        info!("bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            proxy,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves incoming connections until a shutdown signal is received.
    ///
    /// Spawns a task per connection. Shutdown stops accepting; connections
    /// already being served run to completion on their own tasks.
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let proxy = self.proxy.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, proxy).await {
                                    error!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles a single connection, negotiating HTTP/1.1 or HTTP/2.
    async fn handle_connection(stream: tokio::net::TcpStream, proxy: Proxy) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let mut proxy = proxy.clone();
            async move { proxy.call(req).await }
        });

        auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn empty_proxy() -> Proxy {
        Proxy::new(Arc::new(Router::new(&[], &HashMap::new()).unwrap()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_bind() {
        let listener = Listener::bind("127.0.0.1:0", empty_proxy()).await;
        assert!(listener.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_bind_colon_prefix() {
        let listener = Listener::bind(":0", empty_proxy()).await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_bind_invalid_address() {
        let listener = Listener::bind("999.999.999.999:0", empty_proxy()).await;
        assert!(listener.is_err());
    }
}
