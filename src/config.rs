//! Configuration snapshots for the gateway.
//!
//! A [`Config`] is loaded from a YAML or JSON file, validated as a whole, and
//! then treated as immutable; reconfiguration replaces the entire snapshot
//! (see [`crate::watcher`]).

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Log verbosity configured for the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Default `tracing` filter directive for this level.
    ///
    /// `fatal` has no `tracing` equivalent and maps to `error`.
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Load balancing policy for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerType {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
}

impl fmt::Display for BalancerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BalancerType::RoundRobin => "round_robin",
            BalancerType::WeightedRoundRobin => "weighted_round_robin",
            BalancerType::LeastConnections => "least_connections",
        };
        f.write_str(s)
    }
}

/// A backend server with its balancing weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Origin URL of the backend (scheme + authority).
    pub address: String,
    /// Weight for `weighted_round_robin`; ignored by other policies.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// A named group of backends plus the policy that picks among them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub balancer_type: BalancerType,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Match predicate of a route. All present criteria must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteMatch {
    /// Path pattern: literal, `*`, or a trailing `/*` wildcard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// HTTP method; absent means any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Host pattern: literal, leading-`*` suffix, or anchored regex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Required headers with exact values.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub headers: std::collections::BTreeMap<String, String>,
}

impl RouteMatch {
    /// True when no criterion is present at all.
    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.method.is_none() && self.host.is_none() && self.headers.is_empty()
    }
}

/// One arm of a traffic split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSplit {
    pub service: String,
    pub weight: u32,
}

/// A routing rule: a predicate plus a target service or traffic split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    #[serde(rename = "match", default)]
    pub matcher: RouteMatch,
    /// Target service name; mutually exclusive with `split`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Weighted split across services; weights must sum to 100.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub split: Vec<RouteSplit>,
}

/// Health probing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default, with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Duration,
    /// Request path probed on every backend.
    #[serde(default = "default_probe_path")]
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
            path: default_probe_path(),
        }
    }
}

fn default_probe_path() -> String {
    "/health".to_string()
}

/// Telemetry export settings. The exporter pipeline itself lives outside the
/// gateway core; this block is only parsed and validated here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub opentelemetry: OpenTelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Collector endpoint as `host:port`; required when enabled.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for OpenTelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            service_name: String::new(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: default_metrics_interval(),
        }
    }
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(60)
}

/// The full configuration snapshot.
///
/// Loaded once at startup and again by the watcher on file change. Replacing
/// the snapshot is the unit of reconfiguration; the struct itself is never
/// mutated after [`Config::validate`] has accepted it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the proxy listener binds, e.g. `":8080"` or `"127.0.0.1:8080"`.
    #[serde(default)]
    pub listen_addr: String,

    /// Address of the admin listener serving `/health` and `/metrics`.
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

fn default_admin_addr() -> String {
    "127.0.0.1:9090".to_string()
}

impl Config {
    /// Loads and validates a configuration file.
    ///
    /// The format is chosen by extension: `.yaml`/`.yml` or `.json`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;

        let config: Config = match extension(path) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)
                .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?,
            Some("json") => serde_json::from_str(&contents)
                .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?,
            _ => {
                return Err(GatewayError::InvalidConfig(
                    "unsupported config file format".to_string(),
                ))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Serializes the snapshot back to disk, format chosen by extension.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let data = match extension(path) {
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)
                .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?,
            Some("json") => serde_json::to_string_pretty(self)
                .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?,
            _ => {
                return Err(GatewayError::InvalidConfig(
                    "unsupported config file format".to_string(),
                ))
            }
        };
        fs::write(path, data)?;
        Ok(())
    }

    /// Checks every schema rule. An accepted snapshot is safe to hand to the
    /// router, health checker, and listener without further checks.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(invalid("listen address cannot be empty"));
        }
        if self.admin_addr.is_empty() {
            return Err(invalid("admin address cannot be empty"));
        }

        let mut service_names = HashSet::new();
        for svc in &self.services {
            if svc.name.is_empty() {
                return Err(invalid("service name cannot be empty"));
            }
            if !service_names.insert(svc.name.as_str()) {
                return Err(invalid(&format!("duplicate service name: {}", svc.name)));
            }
            if svc.servers.is_empty() {
                return Err(invalid(&format!(
                    "service {}: server list cannot be empty",
                    svc.name
                )));
            }
            for server in &svc.servers {
                if server.address.is_empty() {
                    return Err(invalid(&format!(
                        "service {}: server address cannot be empty",
                        svc.name
                    )));
                }
                if svc.balancer_type == BalancerType::WeightedRoundRobin && server.weight == 0 {
                    return Err(invalid(&format!(
                        "service {}: invalid weight for server {}: 0",
                        svc.name, server.address
                    )));
                }
            }
        }

        let mut route_names = HashSet::new();
        for route in &self.routes {
            self.validate_route(route)?;
            if !route_names.insert(route.name.as_str()) {
                return Err(invalid(&format!("duplicate route name: {}", route.name)));
            }
        }

        self.validate_health_check()?;
        self.validate_telemetry()
    }

    fn validate_route(&self, route: &RouteConfig) -> Result<()> {
        if route.name.is_empty() {
            return Err(invalid("route name cannot be empty"));
        }
        if route.matcher.is_empty() {
            return Err(invalid(&format!(
                "route {}: match condition cannot be empty",
                route.name
            )));
        }
        if route.service.is_none() && route.split.is_empty() {
            return Err(invalid(&format!(
                "route {}: must specify either service or split",
                route.name
            )));
        }

        let known = |name: &str| self.services.iter().any(|s| s.name == name);

        if let Some(service) = &route.service {
            if !known(service) {
                return Err(invalid(&format!(
                    "route {}: unknown service: {}",
                    route.name, service
                )));
            }
        }

        if !route.split.is_empty() {
            let mut total: u64 = 0;
            for split in &route.split {
                if split.service.is_empty() {
                    return Err(invalid(&format!(
                        "route {}: split service cannot be empty",
                        route.name
                    )));
                }
                if !known(&split.service) {
                    return Err(invalid(&format!(
                        "route {}: unknown service: {}",
                        route.name, split.service
                    )));
                }
                if split.weight == 0 {
                    return Err(invalid(&format!(
                        "route {}: split weight must be positive",
                        route.name
                    )));
                }
                total += u64::from(split.weight);
            }
            if total != 100 {
                return Err(invalid(&format!(
                    "route {}: split weights must sum to 100",
                    route.name
                )));
            }
        }

        Ok(())
    }

    fn validate_health_check(&self) -> Result<()> {
        let hc = &self.health_check;
        if hc.interval.is_zero() {
            return Err(invalid("health check interval must be positive"));
        }
        if hc.timeout.is_zero() {
            return Err(invalid("health check timeout must be positive"));
        }
        if hc.timeout >= hc.interval {
            return Err(invalid("health check timeout must be less than interval"));
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let otel = &self.telemetry.opentelemetry;
        if !otel.enabled {
            return Ok(());
        }
        if otel.service_name.is_empty() {
            return Err(invalid("telemetry service name is required when enabled"));
        }
        let (host, port) = otel
            .endpoint
            .rsplit_once(':')
            .ok_or_else(|| invalid("telemetry endpoint must be host:port"))?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(invalid("telemetry endpoint must be host:port"));
        }
        if otel.metrics.interval.is_zero() {
            return Err(invalid("telemetry metrics interval must be positive"));
        }
        Ok(())
    }

    /// Service configurations keyed by name, the shape consumed by
    /// [`crate::router::Router::update`].
    pub fn services_map(&self) -> HashMap<String, ServiceConfig> {
        self.services
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect()
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|s| s.to_str())
}

fn invalid(msg: &str) -> GatewayError {
    GatewayError::InvalidConfig(msg.to_string())
}
