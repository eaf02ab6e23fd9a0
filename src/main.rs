use nexus::admin::AdminListener;
use nexus::config::Config;
use nexus::error::Result;
use nexus::health::HealthChecker;
use nexus::listener::Listener;
use nexus::proxy::Proxy;
use nexus::router::Router;
use nexus::watcher::ConfigWatcher;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    if let Err(e) = run(&config_path).await {
        // The subscriber may not be installed yet when startup fails.
        eprintln!("fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(config_path: &str) -> Result<()> {
    let config = Config::load_from_file(config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(config.log_level.as_filter_directive())
            }),
        )
        .init();

    info!(
        "config: listen={}, services={}, routes={}, health interval={:?}",
        config.listen_addr,
        config.services.len(),
        config.routes.len(),
        config.health_check.interval
    );

    let router = Arc::new(Router::new(&config.routes, &config.services_map())?);

    let health_checker = HealthChecker::new(
        config.health_check.interval,
        config.health_check.timeout,
        &config.health_check.path,
    );
    for service in &config.services {
        for server in &service.servers {
            health_checker.add(&server.address);
        }
    }
    health_checker.start();

    let proxy = Proxy::new(router.clone());

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let proxy_listener = Listener::bind(&config.listen_addr, proxy).await?;
    info!("proxy listening on {}", proxy_listener.local_addr());

    let admin_listener = AdminListener::bind(&config.admin_addr).await?;
    info!(
        "admin endpoints on {} (/health, /metrics)",
        admin_listener.local_addr()
    );

    let watcher = ConfigWatcher::new(config_path);
    watcher.watch({
        let router = router.clone();
        let health_checker = health_checker.clone();
        move |new_config: &Config| {
            apply_reload(&router, &health_checker, new_config);
        }
    });
    watcher.start();

    let mut proxy_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = proxy_listener.serve(shutdown_rx).await {
                error!("proxy listener error: {}", e);
            }
        }
    });

    let mut admin_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = admin_listener.serve(shutdown_rx).await {
                error!("admin listener error: {}", e);
            }
        }
    });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining");
        }
        res = &mut proxy_task => {
            if let Err(err) = res {
                error!("proxy task join error: {}", err);
            }
        }
        res = &mut admin_task => {
            if let Err(err) = res {
                error!("admin task join error: {}", err);
            }
        }
    }

    let _ = shutdown_tx.send(());
    watcher.stop();
    health_checker.stop();

    if !proxy_task.is_finished() {
        let _ = proxy_task.await;
    }
    if !admin_task.is_finished() {
        let _ = admin_task.await;
    }

    info!("shutdown complete");
    Ok(())
}

/// Applies an accepted snapshot to the running router and health checker.
fn apply_reload(router: &Arc<Router>, health_checker: &HealthChecker, config: &Config) {
    if let Err(e) = router.update(&config.routes, &config.services_map()) {
        error!("rejected route update: {}", e);
        return;
    }

    health_checker.update_interval(config.health_check.interval);
    health_checker.update_timeout(config.health_check.timeout);
    health_checker.update_probe_path(&config.health_check.path);

    let desired: HashSet<String> = config
        .services
        .iter()
        .flat_map(|s| s.servers.iter().map(|srv| srv.address.clone()))
        .collect();

    for address in health_checker.addresses() {
        if !desired.contains(&address) {
            health_checker.remove(&address);
        }
    }
    let current: HashSet<String> = health_checker.addresses().into_iter().collect();
    for address in desired.difference(&current) {
        health_checker.add(address);
    }

    info!(
        "configuration applied: services={}, routes={}",
        config.services.len(),
        config.routes.len()
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install ctrl-c handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
