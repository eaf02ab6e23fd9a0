//! Route-matching microbenchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use http::Request;
use nexus::config::{BalancerType, RouteConfig, RouteMatch, ServerConfig, ServiceConfig};
use nexus::router::Router;
use std::collections::HashMap;

fn service_config(name: &str) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        balancer_type: BalancerType::RoundRobin,
        servers: vec![ServerConfig {
            address: format!("http://{name}:8080"),
            weight: 1,
        }],
    }
}

fn route(name: &str, matcher: RouteMatch, service: &str) -> RouteConfig {
    RouteConfig {
        name: name.to_string(),
        matcher,
        service: Some(service.to_string()),
        split: Vec::new(),
    }
}

fn build_router() -> Router {
    let services: HashMap<String, ServiceConfig> = ["svc-a", "svc-b", "svc-c", "svc-d"]
        .iter()
        .map(|n| (n.to_string(), service_config(n)))
        .collect();

    let routes = vec![
        route(
            "exact",
            RouteMatch {
                path: Some("/api/v1".to_string()),
                ..Default::default()
            },
            "svc-a",
        ),
        route(
            "wildcard",
            RouteMatch {
                path: Some("/api/v2/*".to_string()),
                ..Default::default()
            },
            "svc-b",
        ),
        route(
            "deep",
            RouteMatch {
                path: Some("/api/v2/users/profiles/*".to_string()),
                ..Default::default()
            },
            "svc-c",
        ),
        route(
            "complex",
            RouteMatch {
                path: Some("/data".to_string()),
                method: Some("POST".to_string()),
                host: Some("api.example.com".to_string()),
                headers: [("Content-Type".to_string(), "application/json".to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
            "svc-d",
        ),
    ];

    Router::new(&routes, &services).unwrap()
}

fn bench_match(c: &mut Criterion) {
    let router = build_router();

    let simple = Request::builder()
        .method("GET")
        .uri("/api/v1")
        .body(())
        .unwrap();
    let wildcard = Request::builder()
        .method("GET")
        .uri("/api/v2/any/sub/path")
        .body(())
        .unwrap();
    let complex = Request::builder()
        .method("POST")
        .uri("/data")
        .header("Host", "api.example.com")
        .header("Content-Type", "application/json")
        .body(())
        .unwrap();
    let miss = Request::builder()
        .method("GET")
        .uri("/not/found")
        .body(())
        .unwrap();

    let mut group = c.benchmark_group("router_match");
    group.throughput(Throughput::Elements(1));

    group.bench_function("exact_path", |b| {
        b.iter(|| black_box(router.match_request(black_box(&simple))))
    });
    group.bench_function("wildcard_path", |b| {
        b.iter(|| black_box(router.match_request(black_box(&wildcard))))
    });
    group.bench_function("complex_criteria", |b| {
        b.iter(|| black_box(router.match_request(black_box(&complex))))
    });
    group.bench_function("no_match", |b| {
        b.iter(|| black_box(router.match_request(black_box(&miss))))
    });

    group.finish();
}

criterion_group!(benches, bench_match);
criterion_main!(benches);
