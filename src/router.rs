//! Request routing.
//!
//! Routes are compiled into a prefix tree keyed by path segments. Matching is
//! two-phase: an exact walk over literal segments first, then a wildcard scan
//! where the candidate with the longest literal prefix wins. This makes
//! `/api/users` (literal) defeat `/api/*`, and `/api/products/*` defeat
//! `/api/*` for `/api/products/x`.
//!
//! Non-path criteria (method, host, headers) are checked on the terminal
//! node's route list in configuration order; the first match wins.

use crate::config::{RouteConfig, RouteSplit, ServiceConfig};
use crate::error::{GatewayError, Result};
use crate::service::Service;
use crate::telemetry;
use http::header::HOST;
use http::{HeaderMap, Method, Request};
use parking_lot::RwLock;
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

/// Host pattern of a route, compiled once at table-build time.
enum HostPattern {
    /// Exact host string.
    Literal(String),
    /// Leading-`*` subdomain suffix, e.g. `*.example.com`.
    Suffix(String),
    /// Anchored regular expression (begins with `^` or ends with `$`).
    Pattern(Regex),
}

impl HostPattern {
    fn compile(pattern: &str) -> Result<Self> {
        if let Some(suffix) = pattern.strip_prefix('*') {
            return Ok(HostPattern::Suffix(suffix.to_string()));
        }
        if pattern.starts_with('^') || pattern.ends_with('$') {
            let regex = Regex::new(pattern).map_err(|e| {
                GatewayError::InvalidConfig(format!("invalid host pattern {pattern}: {e}"))
            })?;
            return Ok(HostPattern::Pattern(regex));
        }
        Ok(HostPattern::Literal(pattern.to_string()))
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Literal(expected) => host == expected,
            HostPattern::Suffix(suffix) => host.ends_with(suffix),
            HostPattern::Pattern(regex) => regex.is_match(host),
        }
    }
}

/// Where a matched route sends traffic.
enum RouteTarget {
    Service(String),
    Split(Vec<RouteSplit>),
}

/// One compiled route hanging off a terminal tree node. Several can share a
/// node when they differ only in non-path criteria.
struct RouteEntry {
    /// Normalized path pattern this entry was inserted under.
    path: String,
    method: Option<String>,
    host: Option<HostPattern>,
    headers: Vec<(String, String)>,
    target: RouteTarget,
}

impl RouteEntry {
    fn matches(&self, method: &Method, host: Option<&str>, headers: &HeaderMap) -> bool {
        if let Some(expected) = &self.method {
            if expected != method.as_str() {
                return false;
            }
        }

        if let Some(pattern) = &self.host {
            match host {
                Some(host) if pattern.matches(host) => {}
                _ => return false,
            }
        }

        for (name, expected) in &self.headers {
            match headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                Some(actual) if actual == expected => {}
                _ => return false,
            }
        }

        true
    }
}

/// Prefix-tree node. Interior nodes carry a segment label; terminal nodes
/// carry the routes matching that path shape.
struct Node {
    part: String,
    is_wild: bool,
    terminal: bool,
    entries: Vec<RouteEntry>,
    children: Vec<Node>,
}

impl Node {
    fn root() -> Self {
        Self::new("")
    }

    fn new(part: &str) -> Self {
        Self {
            part: part.to_string(),
            is_wild: part == "*",
            terminal: false,
            entries: Vec::new(),
            children: Vec::new(),
        }
    }

    fn insert(&mut self, entry: RouteEntry) {
        if entry.path == "/" {
            self.terminal = true;
            self.entries.push(entry);
            return;
        }

        let path = entry.path.clone();
        let mut current = self;
        for part in path.trim_matches('/').split('/') {
            let idx = match current.children.iter().position(|c| c.part == part) {
                Some(idx) => idx,
                None => {
                    current.children.push(Node::new(part));
                    current.children.len() - 1
                }
            };
            current = &mut current.children[idx];
        }
        current.terminal = true;
        current.entries.push(entry);
    }

    fn search(
        &self,
        path: &str,
        method: &Method,
        host: Option<&str>,
        headers: &HeaderMap,
    ) -> Option<&RouteEntry> {
        if path == "/" {
            if self.terminal {
                return first_matching(&self.entries, method, host, headers);
            }
            return None;
        }

        if let Some(node) = self.search_exact(path) {
            if let Some(entry) = first_matching(&node.entries, method, host, headers) {
                return Some(entry);
            }
        }

        self.search_wildcard(path, method, host, headers)
    }

    /// Exact phase: walk only literal children matching each segment.
    fn search_exact(&self, path: &str) -> Option<&Node> {
        let mut current = self;
        for part in path.trim_matches('/').split('/') {
            current = current
                .children
                .iter()
                .find(|c| !c.is_wild && c.part == part)?;
        }
        current.terminal.then_some(current)
    }

    /// Wildcard phase: among all trailing-wildcard routes whose literal prefix
    /// covers the path, the longest prefix wins; criteria break remaining ties
    /// in configuration order.
    fn search_wildcard(
        &self,
        path: &str,
        method: &Method,
        host: Option<&str>,
        headers: &HeaderMap,
    ) -> Option<&RouteEntry> {
        let mut wildcard_entries = Vec::new();
        self.collect_wildcard_entries(&mut wildcard_entries);

        let mut candidates: Vec<(usize, &RouteEntry)> = Vec::new();
        for entry in wildcard_entries {
            if entry.path == "*" {
                candidates.push((0, entry));
            } else if let Some(prefix) = entry.path.strip_suffix("/*") {
                if path.starts_with(&format!("{prefix}/")) {
                    let segments = prefix.split('/').filter(|s| !s.is_empty()).count();
                    candidates.push((segments, entry));
                }
            }
        }

        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates
            .into_iter()
            .map(|(_, entry)| entry)
            .find(|entry| entry.matches(method, host, headers))
    }

    fn collect_wildcard_entries<'a>(&'a self, out: &mut Vec<&'a RouteEntry>) {
        if self.is_wild && self.terminal {
            out.extend(self.entries.iter());
        }
        for child in &self.children {
            child.collect_wildcard_entries(out);
        }
    }
}

fn first_matching<'a>(
    entries: &'a [RouteEntry],
    method: &Method,
    host: Option<&str>,
    headers: &HeaderMap,
) -> Option<&'a RouteEntry> {
    entries
        .iter()
        .find(|entry| entry.matches(method, host, headers))
}

/// Trims trailing slashes; the root path stays `/`. Trailing `**` wildcards
/// normalize to the `/*` form so both spellings share one tree shape.
fn normalize_pattern(pattern: &str) -> String {
    let trimmed = pattern.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed == "**" {
        return "*".to_string();
    }
    if let Some(prefix) = trimmed.strip_suffix("/**") {
        return format!("{prefix}/*");
    }
    trimmed.to_string()
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

struct RouterState {
    tree: Node,
    services: HashMap<String, Arc<Service>>,
}

/// Matches requests to services and owns the service table.
///
/// `match_request` takes the reader lock; `update` takes the writer lock and
/// swaps tree and table together, so any request observes either the old
/// snapshot or the new one, never a mix.
pub struct Router {
    state: RwLock<RouterState>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

impl Router {
    /// Compiles the initial route table.
    pub fn new(routes: &[RouteConfig], services: &HashMap<String, ServiceConfig>) -> Result<Self> {
        let tree = build_tree(routes, services)?;
        let service_map = services
            .iter()
            .map(|(name, config)| (name.clone(), Arc::new(Service::new(config))))
            .collect();

        Ok(Self {
            state: RwLock::new(RouterState {
                tree,
                services: service_map,
            }),
        })
    }

    /// Resolves a request to a service. `None` means no route matched and the
    /// caller should answer 503.
    pub fn match_request<B>(&self, req: &Request<B>) -> Option<Arc<Service>> {
        let state = self.state.read();

        let path = normalize_path(req.uri().path());
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()));

        let entry = state.tree.search(path, req.method(), host, req.headers())?;

        let name = match &entry.target {
            RouteTarget::Service(name) => name.as_str(),
            RouteTarget::Split(splits) => select_split(splits),
        };
        state.services.get(name).cloned()
    }

    /// Applies a new configuration atomically.
    ///
    /// Services that persist by name are updated in place (preserving their
    /// balancer instances), absent ones are dropped, new ones are created,
    /// and the tree is rebuilt — all under one writer critical section. On
    /// error nothing is changed.
    pub fn update(
        &self,
        routes: &[RouteConfig],
        services: &HashMap<String, ServiceConfig>,
    ) -> Result<()> {
        let mut state = self.state.write();

        // Compile the new tree first so a bad route set cannot leave the
        // table half-updated.
        let tree = build_tree(routes, services)?;

        for (name, config) in services {
            match state.services.get(name) {
                Some(existing) => existing.update(config),
                None => {
                    state
                        .services
                        .insert(name.clone(), Arc::new(Service::new(config)));
                }
            }
        }
        state.services.retain(|name, _| services.contains_key(name));

        state.tree = tree;
        Ok(())
    }

    /// Looks up a service by name.
    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.state.read().services.get(name).cloned()
    }

    /// Number of services currently in the table.
    pub fn service_count(&self) -> usize {
        self.state.read().services.len()
    }
}

fn build_tree(routes: &[RouteConfig], services: &HashMap<String, ServiceConfig>) -> Result<Node> {
    let mut tree = Node::root();

    for route in routes {
        let target = if let Some(service) = &route.service {
            resolve_target(service, services)?;
            RouteTarget::Service(service.clone())
        } else {
            for split in &route.split {
                resolve_target(&split.service, services)?;
            }
            RouteTarget::Split(route.split.clone())
        };

        let host = route
            .matcher
            .host
            .as_deref()
            .map(HostPattern::compile)
            .transpose()?;

        tree.insert(RouteEntry {
            path: normalize_pattern(route.matcher.path.as_deref().unwrap_or("")),
            method: route.matcher.method.clone(),
            host,
            headers: route
                .matcher
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            target,
        });
    }

    Ok(tree)
}

fn resolve_target(name: &str, services: &HashMap<String, ServiceConfig>) -> Result<()> {
    if services.contains_key(name) {
        Ok(())
    } else {
        Err(GatewayError::UnknownService {
            name: name.to_string(),
        })
    }
}

/// Draws a split arm proportionally to its weight from the shared process
/// PRNG. Any positive weight total is accepted.
fn select_split(splits: &[RouteSplit]) -> &str {
    if splits.len() == 1 {
        return &splits[0].service;
    }

    let total: u32 = splits.iter().map(|s| s.weight).sum();
    if total == 0 {
        return &splits[0].service;
    }

    let draw = telemetry::with_rng(|rng| rng.gen_range(0..total));
    let mut cumulative = 0;
    for split in splits {
        cumulative += split.weight;
        if draw < cumulative {
            return &split.service;
        }
    }
    &splits[0].service
}
