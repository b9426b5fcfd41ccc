// src/load_balancer/round_robin.rs
use crate::load_balancer::LoadBalancer;
use crate::proxy::Backend;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Rotates over the healthy subset of each snapshot.
///
/// The counter is shared across calls while the healthy subset is recomputed per call, so
/// a backend leaving or rejoining the healthy set shifts the rotation. Distribution is
/// even while the healthy set is stable and best-effort while it changes.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LoadBalancer for RoundRobinBalancer {
    async fn next_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        let mut healthy = Vec::with_capacity(backends.len());
        for backend in backends {
            if backend.is_healthy().await {
                healthy.push(backend);
            }
        }

        if healthy.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(Arc::clone(healthy[index]))
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use url::Url;

    async fn backends(n: usize) -> Vec<Arc<Backend>> {
        let mut out = Vec::new();
        for i in 1..=n {
            let url = Url::parse(&format!("http://backend{i}:8080")).unwrap();
            let backend = Arc::new(Backend::new(url, 1, 1, Duration::from_secs(30)));
            backend.mark_healthy().await;
            out.push(backend);
        }
        out
    }

    #[tokio::test]
    async fn test_round_robin_order() {
        let lb = RoundRobinBalancer::new();
        let pool = backends(3).await;

        let mut picked = Vec::new();
        for _ in 0..6 {
            picked.push(lb.next_backend(&pool).await.unwrap().id.clone());
        }

        assert_eq!(
            picked,
            vec![
                "backend1:8080",
                "backend2:8080",
                "backend3:8080",
                "backend1:8080",
                "backend2:8080",
                "backend3:8080",
            ]
        );
    }

    #[tokio::test]
    async fn test_skips_unhealthy_backends() {
        let lb = RoundRobinBalancer::new();
        let pool = backends(3).await;
        pool[1].mark_unhealthy().await;

        let mut counts = std::collections::HashMap::new();
        for _ in 0..10 {
            let b = lb.next_backend(&pool).await.unwrap();
            *counts.entry(b.id.clone()).or_insert(0) += 1;
        }

        assert!(!counts.contains_key("backend2:8080"));
        assert_eq!(counts["backend1:8080"], 5);
        assert_eq!(counts["backend3:8080"], 5);
    }

    #[tokio::test]
    async fn test_empty_and_all_unhealthy() {
        let lb = RoundRobinBalancer::new();
        assert!(lb.next_backend(&[]).await.is_none());

        let pool = backends(2).await;
        for b in &pool {
            b.mark_unhealthy().await;
        }
        for _ in 0..3 {
            assert!(lb.next_backend(&pool).await.is_none());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_selection_is_even() {
        let lb = Arc::new(RoundRobinBalancer::new());
        let pool = Arc::new(backends(3).await);

        let tasks: Vec<_> = (0..300)
            .map(|_| {
                let lb = lb.clone();
                let pool = pool.clone();
                tokio::spawn(async move { lb.next_backend(&pool).await.map(|b| b.id.clone()) })
            })
            .collect();

        let mut counts = std::collections::HashMap::new();
        for task in tasks {
            let id = task.await.unwrap().expect("healthy backends available");
            *counts.entry(id).or_insert(0usize) += 1;
        }

        // Every counter increment is unique, so the split is exact
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert_eq!(*count, 100);
        }
    }
}
