//! Nexus - programmable HTTP reverse proxy and layer-7 load balancer
//!
//! Requests are classified against a declarative route table, a backend is
//! drawn from the matched service's balancing policy, and the response is
//! streamed back while health probes and a config-file watcher keep the
//! running state current without restarts.

pub mod admin;
pub mod balancer;
pub mod config;
pub mod error;
pub mod health;
pub mod listener;
pub mod metrics;
pub mod proxy;
pub mod router;
pub mod service;
pub mod telemetry;
pub mod watcher;
