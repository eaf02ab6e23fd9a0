//! A named backend pool bound to one balancing policy.

use crate::balancer::Balancer;
use crate::config::{BalancerType, ServiceConfig};
use crate::error::Result;
use parking_lot::RwLock;
use std::sync::Arc;

/// A service pairs a name with a [`Balancer`] built from its configuration.
///
/// Services are shared as `Arc<Service>`: the router hands clones to in-flight
/// requests, so a reload that drops a service from the table never invalidates
/// a request that already matched it.
pub struct Service {
    inner: RwLock<ServiceState>,
}

struct ServiceState {
    name: String,
    balancer: Balancer,
}

impl Service {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            inner: RwLock::new(ServiceState {
                name: config.name.clone(),
                balancer: Balancer::from_servers(config.balancer_type, &config.servers),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.read().name.clone()
    }

    /// Picks the next backend address per the service's policy.
    pub fn next_server(&self) -> Result<String> {
        self.inner.read().balancer.next()
    }

    /// Signals request completion to the balancer (least-connections only).
    pub fn release(&self, address: &str) {
        self.inner.read().balancer.done(address);
    }

    /// The policy tag, recorded on request spans.
    pub fn strategy(&self) -> BalancerType {
        self.inner.read().balancer.kind()
    }

    /// Current number of backends, recorded on request spans.
    pub fn backend_count(&self) -> usize {
        self.inner.read().balancer.len()
    }

    /// Snapshot of the current backend addresses.
    pub fn backends(&self) -> Vec<String> {
        self.inner.read().balancer.list()
    }

    /// Applies a new configuration in place.
    ///
    /// When the policy is unchanged the balancer instance survives and only
    /// its backend set is replaced; a policy change swaps in a fresh balancer.
    pub fn update(&self, config: &ServiceConfig) {
        let mut state = self.inner.write();
        if state.balancer.kind() == config.balancer_type {
            state.balancer.update_servers(&config.servers);
        } else {
            state.balancer = Balancer::from_servers(config.balancer_type, &config.servers);
        }
        state.name = config.name.clone();
    }

    /// Ties a picked backend to a guard that releases its connection slot
    /// when the response has been fully streamed (or abandoned).
    pub fn track(self: &Arc<Self>, address: String) -> ConnectionGuard {
        ConnectionGuard {
            service: Arc::clone(self),
            address,
        }
    }
}

/// Releases a least-connections slot on drop.
pub struct ConnectionGuard {
    service: Arc<Service>,
    address: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.service.release(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn config(name: &str, balancer_type: BalancerType, addrs: &[&str]) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            balancer_type,
            servers: addrs
                .iter()
                .map(|a| ServerConfig {
                    address: a.to_string(),
                    weight: 1,
                })
                .collect(),
        }
    }

    #[test]
    fn test_name_and_next() {
        let service = Service::new(&config(
            "test-service",
            BalancerType::RoundRobin,
            &["http://b1", "http://b2"],
        ));
        assert_eq!(service.name(), "test-service");

        let first = service.next_server().unwrap();
        let second = service.next_server().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_update_same_policy_replaces_backends() {
        let service = Service::new(&config("svc", BalancerType::RoundRobin, &["http://b1"]));
        service.update(&config("svc", BalancerType::RoundRobin, &["http://b2"]));

        assert_eq!(service.next_server().unwrap(), "http://b2");
        assert_eq!(service.strategy(), BalancerType::RoundRobin);
    }

    #[test]
    fn test_update_policy_change_swaps_balancer() {
        let service = Service::new(&config("svc", BalancerType::RoundRobin, &["http://b1"]));
        service.update(&config(
            "svc-renamed",
            BalancerType::LeastConnections,
            &["http://b1", "http://b2"],
        ));

        assert_eq!(service.name(), "svc-renamed");
        assert_eq!(service.strategy(), BalancerType::LeastConnections);
        assert_eq!(service.backend_count(), 2);
    }

    #[test]
    fn test_connection_guard_releases() {
        let service = Arc::new(Service::new(&config(
            "svc",
            BalancerType::LeastConnections,
            &["http://b1", "http://b2"],
        )));

        let addr = service.next_server().unwrap();
        assert_eq!(addr, "http://b1");
        let guard = service.track(addr);

        // b1 is busy, so the next pick skips it.
        assert_eq!(service.next_server().unwrap(), "http://b2");

        drop(guard);
        // b1 drained while b2 still holds a slot.
        assert_eq!(service.next_server().unwrap(), "http://b1");
    }

    #[test]
    fn test_concurrent_update() {
        let service = Arc::new(Service::new(&config(
            "svc",
            BalancerType::RoundRobin,
            &["http://b1"],
        )));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let service = service.clone();
            handles.push(std::thread::spawn(move || {
                service.update(&config(
                    "concurrent-update",
                    BalancerType::RoundRobin,
                    &["http://b1"],
                ));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(service.name(), "concurrent-update");
    }
}
