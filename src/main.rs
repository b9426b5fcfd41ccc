// src/main.rs
use anyhow::{Context, Result};
use bolt_lb::{
    config::{self, DEFAULT_CONFIG_FILE},
    health::HealthChecker,
    load_balancer::create_load_balancer,
    logging,
    metrics::{MetricsCollector, MetricsRegistry},
    proxy::{BackendPool, Proxy},
    server::{RequestHandler, ServerBuilder},
};
use clap::Parser;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "bolt-lb", version)]
#[command(
    about = "HTTP round-robin load balancer with active and passive health checks",
    long_about = None
)]
struct Cli {
    /// Configuration file (YAML, or JSON for any other extension)
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load_startup_config(&cli.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;

    logging::init(&config.logging)?;
    if Path::new(&cli.config).exists() {
        info!("Loaded configuration from {}", cli.config);
    } else {
        info!("Configuration file '{}' not found, using default configuration", cli.config);
    }
    info!(
        "Starting bolt-lb {} with {} backend(s), strategy {}",
        env!("CARGO_PKG_VERSION"),
        config.backends.len(),
        config.strategy
    );

    let pool = Arc::new(BackendPool::from_configs(&config.backends)?);
    let algorithm = create_load_balancer(&config.strategy)?;

    let metrics: Option<Arc<MetricsCollector>> = if config.metrics.enabled {
        let registry = MetricsRegistry::new()?;
        let collector = registry.collector();
        collector.update_backend_counts(0, pool.size().await);

        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(metrics_addr, registry, config.metrics.path.clone())?;
        Some(collector)
    } else {
        None
    };

    let checker = Arc::new(HealthChecker::new(
        config.health_check.clone(),
        pool.clone(),
        metrics.clone(),
    )?);
    if !checker.start().await {
        warn!(
            "Active health checks are disabled; backends stay unknown and \
             receive no traffic until a check marks them healthy"
        );
    }

    let proxy = Arc::new(Proxy::new(&config, pool, algorithm, metrics));
    info!("Load balancing algorithm: {}", proxy.algorithm_name());

    let result = ServerBuilder::new(config.server.bind_address())
        .with_handler(RequestHandler::new(proxy))
        .serve_with_shutdown(shutdown_signal())
        .await;

    checker.stop().await;
    info!("Load balancer stopped");

    result
}

fn start_metrics_server(addr: SocketAddr, registry: MetricsRegistry, path: String) -> Result<()> {
    let registry = Arc::new(registry);
    let metrics_path = Arc::new(path);
    let service_path = metrics_path.clone();

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = registry.clone();
        let path = service_path.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let path = path.clone();

                async move { Ok::<_, Infallible>(metrics_response(&req, &registry, &path)) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?
        .serve(make_service);

    info!(
        "Metrics server listening on http://{}{}",
        addr,
        metrics_path.as_str()
    );

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

fn metrics_response(req: &Request<Body>, registry: &MetricsRegistry, path: &str) -> Response<Body> {
    if req.uri().path() != path {
        let mut response = Response::new(Body::from("Not Found"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }

    match registry.gather() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            let mut response = Response::new(Body::from("Internal Server Error"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received");
}
