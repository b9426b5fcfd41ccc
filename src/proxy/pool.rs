//
// src/proxy/pool.rs
//

use super::backend::Backend;
use crate::config::{BackendConfig, ConfigError};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Fixed, ordered set of backends. Membership is append-only during startup; after that
/// only each backend's own health state changes.
#[derive(Debug, Default)]
pub struct BackendPool {
    backends: RwLock<Vec<Arc<Backend>>>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[BackendConfig]) -> Result<Self, ConfigError> {
        let backends = configs
            .iter()
            .enumerate()
            .map(|(index, config)| Backend::from_config(index, config).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        for backend in &backends {
            tracing::info!(
                "Added backend {} (weight={}, max_fails={}, fail_timeout={:?})",
                backend.url, backend.weight, backend.max_fails, backend.fail_timeout
            );
        }

        Ok(Self {
            backends: RwLock::new(backends),
        })
    }

    pub async fn add_backend(&self, backend: Arc<Backend>) {
        tracing::info!("Added backend {}", backend.url);
        self.backends.write().await.push(backend);
    }

    /// Shallow copy of the member list, in insertion order.
    pub async fn snapshot(&self) -> Vec<Arc<Backend>> {
        self.backends.read().await.clone()
    }

    pub async fn healthy_snapshot(&self) -> Vec<Arc<Backend>> {
        let mut healthy = Vec::new();

        for backend in self.snapshot().await {
            if backend.is_healthy().await {
                healthy.push(backend);
            }
        }

        healthy
    }

    pub async fn size(&self) -> usize {
        self.backends.read().await.len()
    }

    pub async fn healthy_size(&self) -> usize {
        self.healthy_snapshot().await.len()
    }
}
