// ────────────────────────────────
// src/server/listener.rs
// Low-level TCP bind, kept apart so TLS can be layered on later.
// ────────────────────────────────
use anyhow::{Context, Result};
use tokio::net::TcpListener;

/// `addr` is `host:port`; the host may be a name that still needs resolving.
pub async fn bind_tcp(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    Ok(listener)
}
