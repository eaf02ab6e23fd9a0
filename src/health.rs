//! Background health probing of backend addresses.
//!
//! One loop owns the tick; each tick probes every registered address
//! concurrently, so a slow backend costs one timeout rather than delaying the
//! whole sweep. Verdicts are exposed through [`HealthChecker::is_healthy`]
//! and never propagate as errors.

use http::{Request, StatusCode, Uri};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, Instrument};

/// Health record for one backend address.
#[derive(Debug, Clone)]
struct BackendHealth {
    healthy: bool,
    last_probe_duration: Option<Duration>,
}

struct Inner {
    servers: RwLock<HashMap<String, BackendHealth>>,
    interval: RwLock<Duration>,
    timeout: RwLock<Duration>,
    probe_path: RwLock<String>,
    client: Client<HttpConnector, Empty<Bytes>>,
    stop_tx: watch::Sender<bool>,
}

/// Periodic prober maintaining a healthy/unhealthy verdict per address.
///
/// Cloning shares the same state; `start` spawns the single probe loop.
#[derive(Clone)]
pub struct HealthChecker {
    inner: Arc<Inner>,
}

impl HealthChecker {
    pub fn new(interval: Duration, timeout: Duration, probe_path: &str) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                servers: RwLock::new(HashMap::new()),
                interval: RwLock::new(interval),
                timeout: RwLock::new(timeout),
                probe_path: RwLock::new(probe_path.to_string()),
                client: Client::builder(TokioExecutor::new()).build_http(),
                stop_tx,
            }),
        }
    }

    /// Registers an address. A fresh backend counts as healthy until its
    /// first probe returns, so new backends are not starved of traffic.
    pub fn add(&self, address: &str) {
        self.inner.servers.write().insert(
            address.to_string(),
            BackendHealth {
                healthy: true,
                last_probe_duration: None,
            },
        );
    }

    /// Deregisters an address, discarding its verdict.
    pub fn remove(&self, address: &str) {
        self.inner.servers.write().remove(address);
    }

    /// Current verdict for an address; unknown addresses are unhealthy.
    pub fn is_healthy(&self, address: &str) -> bool {
        self.inner
            .servers
            .read()
            .get(address)
            .map(|s| s.healthy)
            .unwrap_or(false)
    }

    /// Snapshot of all registered addresses.
    pub fn addresses(&self) -> Vec<String> {
        self.inner.servers.read().keys().cloned().collect()
    }

    /// Takes effect on the next tick.
    pub fn update_interval(&self, interval: Duration) {
        *self.inner.interval.write() = interval;
    }

    /// Takes effect on the next tick.
    pub fn update_timeout(&self, timeout: Duration) {
        *self.inner.timeout.write() = timeout;
    }

    pub fn update_probe_path(&self, path: &str) {
        *self.inner.probe_path.write() = path.to_string();
    }

    /// Spawns the probe loop. The loop re-reads the interval every iteration
    /// and exits at the next tick boundary after [`HealthChecker::stop`].
    pub fn start(&self) {
        let checker = self.clone();
        let mut stop_rx = self.inner.stop_tx.subscribe();

        tokio::spawn(async move {
            info!(
                interval = ?*checker.inner.interval.read(),
                "starting health checker"
            );
            loop {
                let interval = *checker.inner.interval.read();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        checker.probe_all().await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            info!("health checker shutting down");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Signals the loop to exit. In-flight probes run to their deadline.
    pub fn stop(&self) {
        let _ = self.inner.stop_tx.send(true);
    }

    /// Probes every registered address concurrently and waits for the sweep
    /// to finish.
    async fn probe_all(&self) {
        let addresses = self.addresses();
        let timeout = *self.inner.timeout.read();
        let probe_path = self.inner.probe_path.read().clone();

        let mut tasks = Vec::with_capacity(addresses.len());
        for address in addresses {
            let checker = self.clone();
            let probe_path = probe_path.clone();
            tasks.push(tokio::spawn(async move {
                checker.probe(&address, &probe_path, timeout).await;
            }));
        }

        for task in tasks {
            let _ = task.await;
        }
    }

    /// One probe: GET `address + probe_path` under the configured deadline.
    /// Healthy iff the response arrives in time with status 200.
    async fn probe(&self, address: &str, probe_path: &str, timeout: Duration) {
        let span = tracing::info_span!(
            "HealthCheck",
            service.address = %address,
            check.healthy = tracing::field::Empty,
            check.duration_ms = tracing::field::Empty,
        );

        async {
            let start = Instant::now();
            let result = self.http_check(address, probe_path, timeout).await;
            let duration = start.elapsed();
            let healthy = result.is_ok();

            let span = tracing::Span::current();
            span.record("check.healthy", healthy);
            span.record("check.duration_ms", duration.as_millis() as u64);

            if let Err(reason) = &result {
                error!(
                    address = %address,
                    duration_ms = duration.as_millis() as u64,
                    error = %reason,
                    "health check failed"
                );
            } else {
                debug!(address = %address, duration_ms = duration.as_millis() as u64, "probe ok");
            }

            self.record_verdict(address, healthy, duration);
        }
        .instrument(span)
        .await
    }

    async fn http_check(
        &self,
        address: &str,
        probe_path: &str,
        timeout: Duration,
    ) -> Result<(), String> {
        let uri: Uri = format!("{address}{probe_path}")
            .parse()
            .map_err(|e: http::uri::InvalidUri| e.to_string())?;

        let req = Request::get(uri)
            .body(Empty::<Bytes>::new())
            .map_err(|e| e.to_string())?;

        let response = tokio::time::timeout(timeout, self.inner.client.request(req))
            .await
            .map_err(|_| "probe timed out".to_string())?
            .map_err(|e| e.to_string())?;

        if response.status() != StatusCode::OK {
            return Err(format!("unexpected status code: {}", response.status()));
        }
        Ok(())
    }

    fn record_verdict(&self, address: &str, healthy: bool, duration: Duration) {
        let mut servers = self.inner.servers.write();
        // The address may have been removed while the probe was in flight.
        if let Some(info) = servers.get_mut(address) {
            info.healthy = healthy;
            info.last_probe_duration = Some(duration);
        }
    }
}
