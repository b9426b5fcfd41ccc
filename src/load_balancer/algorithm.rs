// src/load_balancer/algorithm.rs
use crate::proxy::Backend;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Pick one backend from an unfiltered snapshot; health filtering is the
    /// algorithm's job. `None` means nothing is available.
    async fn next_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported load balancing strategy: {0}")]
pub struct UnsupportedAlgorithm(pub String);
