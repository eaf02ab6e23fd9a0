//! Error types for the gateway.

use std::io;
use thiserror::Error;

/// Errors that can occur while routing, balancing, or forwarding requests.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Failed to bind a listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// No route matched the request.
    #[error("no route matched path {path}")]
    NoRoute { path: String },

    /// The matched service has an empty backend set.
    #[error("no servers available")]
    NoBackends,

    /// A route or split references a service missing from the service table.
    #[error("unknown service: {name}")]
    UnknownService { name: String },

    /// The selected backend address is not a parseable origin URL.
    #[error("invalid target url {url}: {reason}")]
    InvalidTargetUrl { url: String, reason: String },

    /// The upstream request failed in transit.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// Connection-level error while serving a client.
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
