//! Prometheus metrics for the request path.

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex};

/// Labels for proxied request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// HTTP method (GET, POST, ...)
    pub method: String,
    /// HTTP status code returned to the client
    pub status: String,
    /// Name of the service the request resolved to ("" when unrouted)
    pub service: String,
}

/// Global metrics registry, initialized once at startup and shared across
/// all tasks.
static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Metrics collector for the gateway.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<RequestLabels, Counter>,
    request_latency: Family<RequestLabels, Histogram>,
    requests_in_flight: Gauge<i64, AtomicI64>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "nexus_requests_total",
            "Total number of proxied requests",
            requests_total.clone(),
        );

        let request_latency = Family::<RequestLabels, Histogram>::new_with_constructor(|| {
            // Buckets: 0.5ms up to ~8s
            Histogram::new(exponential_buckets(0.5, 2.0, 15))
        });
        registry.register(
            "nexus_request_latency",
            "Request latency in milliseconds",
            request_latency.clone(),
        );

        let requests_in_flight = Gauge::<i64, AtomicI64>::default();
        registry.register(
            "nexus_requests_in_flight",
            "Number of requests currently being proxied",
            requests_in_flight.clone(),
        );

        Self {
            registry,
            requests_total,
            request_latency,
            requests_in_flight,
        }
    }

    /// Records a completed request.
    pub fn record_request(method: &str, status: u16, service: &str, latency_ms: f64) {
        let labels = RequestLabels {
            method: method.to_string(),
            status: status.to_string(),
            service: service.to_string(),
        };

        if let Ok(metrics) = METRICS.lock() {
            metrics.requests_total.get_or_create(&labels).inc();
            metrics
                .request_latency
                .get_or_create(&labels)
                .observe(latency_ms);
        }
    }

    /// Increments the in-flight request gauge.
    pub fn inc_requests_in_flight() {
        if let Ok(metrics) = METRICS.lock() {
            metrics.requests_in_flight.inc();
        }
    }

    /// Decrements the in-flight request gauge.
    pub fn dec_requests_in_flight() {
        if let Ok(metrics) = METRICS.lock() {
            metrics.requests_in_flight.dec();
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {}", e)))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}
