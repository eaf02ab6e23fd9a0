//! Backend selection policies.
//!
//! A [`Balancer`] owns the backend set of one service and picks the next
//! address per its policy. Every operation takes the policy's internal lock,
//! so concurrent `next()` calls and concurrent mutation from reloads are both
//! safe; the critical sections are a few loads and stores.

use crate::config::{BalancerType, ServerConfig};
use crate::error::{GatewayError, Result};
use parking_lot::Mutex;
use tracing::debug;

/// A selection policy over a backend set.
pub enum Balancer {
    RoundRobin(RoundRobin),
    WeightedRoundRobin(WeightedRoundRobin),
    LeastConnections(LeastConnections),
}

impl Balancer {
    /// Creates an empty balancer of the given policy.
    pub fn new(kind: BalancerType) -> Self {
        match kind {
            BalancerType::RoundRobin => Balancer::RoundRobin(RoundRobin::new()),
            BalancerType::WeightedRoundRobin => {
                Balancer::WeightedRoundRobin(WeightedRoundRobin::new())
            }
            BalancerType::LeastConnections => Balancer::LeastConnections(LeastConnections::new()),
        }
    }

    /// Creates a balancer pre-populated from a service configuration.
    pub fn from_servers(kind: BalancerType, servers: &[ServerConfig]) -> Self {
        let balancer = Self::new(kind);
        balancer.update_servers(servers);
        balancer
    }

    /// Returns the next backend address, or [`GatewayError::NoBackends`] when
    /// the set is empty.
    pub fn next(&self) -> Result<String> {
        match self {
            Balancer::RoundRobin(b) => b.next(),
            Balancer::WeightedRoundRobin(b) => b.next(),
            Balancer::LeastConnections(b) => b.next(),
        }
    }

    /// Adds a backend with the policy's default weight.
    pub fn add(&self, address: &str) {
        match self {
            Balancer::RoundRobin(b) => b.add(address),
            Balancer::WeightedRoundRobin(b) => b.add_weighted(address, 1),
            Balancer::LeastConnections(b) => b.add(address),
        }
    }

    /// Adds a backend with an explicit weight. A zero weight falls back to
    /// the default of 1. Policies without weights ignore it.
    pub fn add_weighted(&self, address: &str, weight: u32) {
        match self {
            Balancer::WeightedRoundRobin(b) => b.add_weighted(address, weight),
            _ => self.add(address),
        }
    }

    /// Removes a backend by address. Unknown addresses are ignored.
    pub fn remove(&self, address: &str) {
        match self {
            Balancer::RoundRobin(b) => b.remove(address),
            Balancer::WeightedRoundRobin(b) => b.remove(address),
            Balancer::LeastConnections(b) => b.remove(address),
        }
    }

    /// Replaces the whole backend set. Cursors reset so no stale index can
    /// outlive the old set.
    pub fn update_servers(&self, servers: &[ServerConfig]) {
        match self {
            Balancer::RoundRobin(b) => b.update_servers(servers),
            Balancer::WeightedRoundRobin(b) => b.update_servers(servers),
            Balancer::LeastConnections(b) => b.update_servers(servers),
        }
    }

    /// Signals that a request to `address` has completed. Only
    /// least-connections tracks this; the other policies ignore it.
    pub fn done(&self, address: &str) {
        if let Balancer::LeastConnections(b) = self {
            b.done(address);
        }
    }

    /// The policy tag, used by tracing and by the reload path to decide
    /// whether an instance can be updated in place.
    pub fn kind(&self) -> BalancerType {
        match self {
            Balancer::RoundRobin(_) => BalancerType::RoundRobin,
            Balancer::WeightedRoundRobin(_) => BalancerType::WeightedRoundRobin,
            Balancer::LeastConnections(_) => BalancerType::LeastConnections,
        }
    }

    /// Snapshot of the current backend addresses.
    pub fn list(&self) -> Vec<String> {
        match self {
            Balancer::RoundRobin(b) => b.state.lock().servers.clone(),
            Balancer::WeightedRoundRobin(b) => {
                b.state.lock().servers.iter().map(|s| s.address.clone()).collect()
            }
            Balancer::LeastConnections(b) => {
                b.state.lock().servers.iter().map(|s| s.address.clone()).collect()
            }
        }
    }

    /// Number of backends currently in the set.
    pub fn len(&self) -> usize {
        match self {
            Balancer::RoundRobin(b) => b.state.lock().servers.len(),
            Balancer::WeightedRoundRobin(b) => b.state.lock().servers.len(),
            Balancer::LeastConnections(b) => b.state.lock().servers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plain round-robin: a cursor that wraps over the backend list.
pub struct RoundRobin {
    state: Mutex<RoundRobinState>,
}

struct RoundRobinState {
    servers: Vec<String>,
    index: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RoundRobinState {
                servers: Vec::new(),
                index: 0,
            }),
        }
    }

    fn next(&self) -> Result<String> {
        let mut state = self.state.lock();
        if state.servers.is_empty() {
            return Err(GatewayError::NoBackends);
        }

        let index = state.index;
        let server = state.servers[index].clone();
        state.index = (index + 1) % state.servers.len();

        debug!(backend.address = %server, backend.index = index, "Selected backend");
        Ok(server)
    }

    fn add(&self, address: &str) {
        self.state.lock().servers.push(address.to_string());
    }

    fn remove(&self, address: &str) {
        let mut state = self.state.lock();
        if let Some(pos) = state.servers.iter().position(|s| s == address) {
            state.servers.remove(pos);
            if state.index >= state.servers.len() {
                state.index = 0;
            }
        }
    }

    fn update_servers(&self, servers: &[ServerConfig]) {
        let mut state = self.state.lock();
        state.servers = servers.iter().map(|s| s.address.clone()).collect();
        state.index = 0;
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

/// Weighted round-robin: an outer cursor over the list and an inner counter
/// over the current entry's weight, yielding contiguous bursts per backend.
pub struct WeightedRoundRobin {
    state: Mutex<WeightedState>,
}

struct WeightedState {
    servers: Vec<WeightedServer>,
    index: usize,
    current: u32,
}

struct WeightedServer {
    address: String,
    weight: u32,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WeightedState {
                servers: Vec::new(),
                index: 0,
                current: 0,
            }),
        }
    }

    fn next(&self) -> Result<String> {
        let mut state = self.state.lock();
        if state.servers.is_empty() {
            return Err(GatewayError::NoBackends);
        }

        loop {
            let index = state.index;
            if state.current < state.servers[index].weight {
                state.current += 1;
                let server = state.servers[index].address.clone();
                debug!(backend.address = %server, backend.index = index, "Selected backend");
                return Ok(server);
            }

            state.current = 0;
            state.index = (index + 1) % state.servers.len();
        }
    }

    fn add_weighted(&self, address: &str, weight: u32) {
        self.state.lock().servers.push(WeightedServer {
            address: address.to_string(),
            weight: effective_weight(weight),
        });
    }

    fn remove(&self, address: &str) {
        let mut state = self.state.lock();
        if let Some(pos) = state.servers.iter().position(|s| s.address == address) {
            state.servers.remove(pos);
            if state.index >= state.servers.len() {
                state.index = 0;
                state.current = 0;
            }
        }
    }

    fn update_servers(&self, servers: &[ServerConfig]) {
        let mut state = self.state.lock();
        state.servers = servers
            .iter()
            .map(|s| WeightedServer {
                address: s.address.clone(),
                weight: effective_weight(s.weight),
            })
            .collect();
        state.index = 0;
        state.current = 0;
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

/// A zero configured weight behaves as the default weight of 1; the `next`
/// loop relies on every weight being positive to terminate.
fn effective_weight(weight: u32) -> u32 {
    weight.max(1)
}

/// Least-connections: pick the backend with the fewest in-flight requests.
///
/// The set is scanned linearly; backend pools are small. The forwarder must
/// call [`Balancer::done`] when a request completes so the count drains.
pub struct LeastConnections {
    state: Mutex<LeastConnectionsState>,
}

struct LeastConnectionsState {
    servers: Vec<CountedServer>,
}

struct CountedServer {
    address: String,
    active: u32,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LeastConnectionsState {
                servers: Vec::new(),
            }),
        }
    }

    fn next(&self) -> Result<String> {
        let mut state = self.state.lock();
        if state.servers.is_empty() {
            return Err(GatewayError::NoBackends);
        }

        // Ties break toward the first entry, so an all-idle pool always
        // yields the first backend.
        let mut selected = 0;
        for (i, server) in state.servers.iter().enumerate() {
            if server.active < state.servers[selected].active {
                selected = i;
            }
        }

        state.servers[selected].active += 1;
        let server = state.servers[selected].address.clone();
        debug!(backend.address = %server, backend.index = selected, "Selected backend");
        Ok(server)
    }

    fn add(&self, address: &str) {
        self.state.lock().servers.push(CountedServer {
            address: address.to_string(),
            active: 0,
        });
    }

    fn remove(&self, address: &str) {
        let mut state = self.state.lock();
        if let Some(pos) = state.servers.iter().position(|s| s.address == address) {
            state.servers.remove(pos);
        }
    }

    fn update_servers(&self, servers: &[ServerConfig]) {
        let mut state = self.state.lock();
        state.servers = servers
            .iter()
            .map(|s| CountedServer {
                address: s.address.clone(),
                active: 0,
            })
            .collect();
    }

    fn done(&self, address: &str) {
        let mut state = self.state.lock();
        if let Some(server) = state.servers.iter_mut().find(|s| s.address == address) {
            server.active = server.active.saturating_sub(1);
        }
    }
}

impl Default for LeastConnections {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(addrs: &[(&str, u32)]) -> Vec<ServerConfig> {
        addrs
            .iter()
            .map(|(address, weight)| ServerConfig {
                address: address.to_string(),
                weight: *weight,
            })
            .collect()
    }

    #[test]
    fn test_round_robin_fairness() {
        let balancer = Balancer::from_servers(
            BalancerType::RoundRobin,
            &servers(&[("b1", 1), ("b2", 1), ("b3", 1)]),
        );

        let mut counts = std::collections::HashMap::new();
        for _ in 0..9 {
            *counts.entry(balancer.next().unwrap()).or_insert(0) += 1;
        }
        assert_eq!(counts["b1"], 3);
        assert_eq!(counts["b2"], 3);
        assert_eq!(counts["b3"], 3);
    }

    #[test]
    fn test_round_robin_order() {
        let balancer = Balancer::from_servers(
            BalancerType::RoundRobin,
            &servers(&[("b1", 1), ("b2", 1)]),
        );
        let picks: Vec<_> = (0..4).map(|_| balancer.next().unwrap()).collect();
        assert_eq!(picks, ["b1", "b2", "b1", "b2"]);
    }

    #[test]
    fn test_round_robin_empty() {
        let balancer = Balancer::new(BalancerType::RoundRobin);
        assert!(matches!(
            balancer.next(),
            Err(GatewayError::NoBackends)
        ));
    }

    #[test]
    fn test_round_robin_remove_wraps_cursor() {
        let balancer = Balancer::from_servers(
            BalancerType::RoundRobin,
            &servers(&[("b1", 1), ("b2", 1), ("b3", 1)]),
        );
        // Advance the cursor to the last slot, then shrink the set under it.
        balancer.next().unwrap();
        balancer.next().unwrap();
        balancer.remove("b2");
        balancer.remove("b3");
        assert_eq!(balancer.next().unwrap(), "b1");
    }

    #[test]
    fn test_weighted_cycle_contiguous() {
        let balancer = Balancer::from_servers(
            BalancerType::WeightedRoundRobin,
            &servers(&[("b1", 2), ("b2", 1)]),
        );
        let picks: Vec<_> = (0..6).map(|_| balancer.next().unwrap()).collect();
        assert_eq!(picks, ["b1", "b1", "b2", "b1", "b1", "b2"]);
    }

    #[test]
    fn test_weighted_fairness_over_cycle() {
        let balancer = Balancer::from_servers(
            BalancerType::WeightedRoundRobin,
            &servers(&[("b1", 3), ("b2", 2), ("b3", 5)]),
        );
        let mut counts = std::collections::HashMap::new();
        for _ in 0..10 {
            *counts.entry(balancer.next().unwrap()).or_insert(0) += 1;
        }
        assert_eq!(counts["b1"], 3);
        assert_eq!(counts["b2"], 2);
        assert_eq!(counts["b3"], 5);
    }

    #[test]
    fn test_weighted_zero_weight_defaults_to_one() {
        let balancer = Balancer::new(BalancerType::WeightedRoundRobin);
        balancer.add_weighted("b1", 0);
        assert_eq!(balancer.next().unwrap(), "b1");
        assert_eq!(balancer.next().unwrap(), "b1");
    }

    #[test]
    fn test_least_connections_anchor() {
        let balancer = Balancer::from_servers(
            BalancerType::LeastConnections,
            &servers(&[("b1", 1), ("b2", 1), ("b3", 1)]),
        );
        // All counts equal: the first backend wins.
        assert_eq!(balancer.next().unwrap(), "b1");
        // b1 now has one active request, so the scan moves on.
        assert_eq!(balancer.next().unwrap(), "b2");
        assert_eq!(balancer.next().unwrap(), "b3");
        assert_eq!(balancer.next().unwrap(), "b1");
    }

    #[test]
    fn test_least_connections_done_drains() {
        let balancer = Balancer::from_servers(
            BalancerType::LeastConnections,
            &servers(&[("b1", 1), ("b2", 1)]),
        );
        assert_eq!(balancer.next().unwrap(), "b1");
        assert_eq!(balancer.next().unwrap(), "b2");
        balancer.done("b1");
        assert_eq!(balancer.next().unwrap(), "b1");
    }

    #[test]
    fn test_least_connections_done_floors_at_zero() {
        let balancer = Balancer::from_servers(
            BalancerType::LeastConnections,
            &servers(&[("b1", 1), ("b2", 1)]),
        );
        balancer.done("b1");
        balancer.done("b1");
        assert_eq!(balancer.next().unwrap(), "b1");
    }

    #[test]
    fn test_update_servers_resets_cursor() {
        let balancer = Balancer::from_servers(
            BalancerType::RoundRobin,
            &servers(&[("b1", 1), ("b2", 1)]),
        );
        balancer.next().unwrap();
        balancer.update_servers(&servers(&[("b3", 1), ("b4", 1)]));
        assert_eq!(balancer.next().unwrap(), "b3");
        assert_eq!(balancer.list(), ["b3", "b4"]);
    }

    #[test]
    fn test_kind_and_len() {
        let balancer = Balancer::from_servers(
            BalancerType::LeastConnections,
            &servers(&[("b1", 1), ("b2", 1)]),
        );
        assert_eq!(balancer.kind(), BalancerType::LeastConnections);
        assert_eq!(balancer.len(), 2);
        assert!(!balancer.is_empty());
    }

    #[test]
    fn test_concurrent_next_and_update() {
        use std::sync::Arc;

        let balancer = Arc::new(Balancer::from_servers(
            BalancerType::RoundRobin,
            &servers(&[("b1", 1), ("b2", 1)]),
        ));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let balancer = balancer.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let addr = balancer.next().unwrap();
                    // Every result belongs to the old set or the new set.
                    assert!(["b1", "b2", "b3"].contains(&addr.as_str()));
                }
            }));
        }

        let updater = balancer.clone();
        handles.push(std::thread::spawn(move || {
            updater.update_servers(&servers(&[("b3", 1)]));
        }));

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
