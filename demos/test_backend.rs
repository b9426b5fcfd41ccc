//! demos/test_backend.rs
//! Mock upstream for trying the load balancer locally.
//! Run: cargo run --example test_backend -- --port 8081 --name a --fail-pct 10

use clap::Parser;
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use rand::Rng;
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::sleep;
use tracing::info;

#[derive(Parser, Clone)]
#[command(name = "test_backend", about = "Mock upstream with injectable latency and failures")]
struct Args {
    #[arg(short, long, default_value_t = 8081)]
    port: u16,

    #[arg(short, long)]
    name: Option<String>,

    /// Liveness path answered by the checker probe
    #[arg(long, default_value = "/health")]
    health_path: String,

    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    #[arg(long, default_value_t = 0)]
    jitter_ms: u64,

    /// Percentage of proxied requests answered with 500
    #[arg(long, default_value_t = 0.0)]
    fail_pct: f64,

    /// Flip the liveness answer every N seconds (0 = never)
    #[arg(long, default_value_t = 0)]
    flip_health_secs: u64,
}

#[derive(Clone)]
struct BackendState {
    name: String,
    args: Args,
    requests: Arc<AtomicU64>,
    live: Arc<AtomicBool>,
}

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn handle(req: Request<Body>, state: BackendState) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_owned();

    // Liveness is always fast
    if path == state.args.health_path {
        return Ok(if state.live.load(Ordering::SeqCst) {
            respond(StatusCode::OK, "OK")
        } else {
            respond(StatusCode::SERVICE_UNAVAILABLE, "Unhealthy")
        });
    }

    let n = state.requests.fetch_add(1, Ordering::SeqCst) + 1;
    let forwarded_for = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_owned();

    let delay = state.args.delay_ms + rand::thread_rng().gen_range(0..=state.args.jitter_ms);
    if delay > 0 {
        sleep(Duration::from_millis(delay)).await;
    }

    if state.args.fail_pct > 0.0
        && rand::thread_rng().gen_bool((state.args.fail_pct / 100.0).clamp(0.0, 1.0))
    {
        return Ok(respond(StatusCode::INTERNAL_SERVER_ERROR, "Injected failure"));
    }

    info!(%path, %forwarded_for, request = n, delay_ms = delay, "served");

    let body = serde_json::json!({
        "backend": state.name,
        "port": state.args.port,
        "request": n,
        "path": path,
        "forwarded_for": forwarded_for,
        "delay_ms": delay,
    });

    let mut response = respond(StatusCode::OK, body.to_string());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(&state.name) {
        response.headers_mut().insert("x-backend-name", value);
    }
    Ok(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| format!("backend-{}", args.port));

    let state = BackendState {
        name: name.clone(),
        args: args.clone(),
        requests: Arc::new(AtomicU64::new(0)),
        live: Arc::new(AtomicBool::new(true)),
    };

    if args.flip_health_secs > 0 {
        let st = state.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(st.args.flip_health_secs)).await;
                let live = !st.live.fetch_xor(true, Ordering::SeqCst);
                let state = if live { "healthy" } else { "unhealthy" };
                info!("[{}] liveness flipped to {}", st.name, state);
            }
        });
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let make_svc = make_service_fn(move |_conn| {
        let st = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, st.clone()))) }
    });

    info!(
        "Mock backend '{}' on http://{} [delay={}ms±{} fail={}%]",
        name, addr, args.delay_ms, args.jitter_ms, args.fail_pct
    );

    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}
