// src/health/checker.rs
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{Backend, BackendPool};
use anyhow::{Context, Result};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const PROBE_USER_AGENT: &str = concat!("bolt-lb/", env!("CARGO_PKG_VERSION"), " HealthChecker");

pub struct HealthChecker {
    config: HealthCheckConfig,
    pool: Arc<BackendPool>,
    client: Client,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
pub struct HealthCheckResult {
    pub backend_id: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        pool: Arc<BackendPool>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to create health check HTTP client")?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            pool,
            client,
            metrics,
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    /// Spawn the probing loop. Returns false, spawning nothing, when checks are disabled
    /// or the loop is already running. A stopped checker can be started again.
    pub async fn start(self: &Arc<Self>) -> bool {
        if !self.config.enabled {
            info!("Active health checks disabled");
            return false;
        }

        let mut task = self.task.lock().await;
        if task.is_some() {
            return false;
        }

        // Subscribe before spawning so a stop() racing the spawn is still observed
        self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();

        *task = Some(tokio::spawn(self.clone().run(shutdown_rx)));
        true
    }

    /// Ask the loop to exit after its current sweep and wait until it has.
    pub async fn stop(&self) {
        // Under the task lock so a concurrent start() cannot clear the request
        let handle = {
            let mut task = self.task.lock().await;
            self.shutdown_tx.send_replace(true);
            task.take()
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Health checker task failed: {}", e);
            }
        }
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        // First tick completes immediately
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Starting health checker with interval: {:?}, path: {}",
            self.config.interval(),
            self.config.path
        );

        loop {
            // Shutdown wins over a tick that is ready at the same time
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.clone().check_all_backends().await;
                }
            }
        }
    }

    /// One sweep: probe every backend concurrently and wait for all of them.
    pub async fn check_all_backends(self: Arc<Self>) -> Vec<HealthCheckResult> {
        let backends = self.pool.snapshot().await;
        let mut tasks = Vec::with_capacity(backends.len());

        for backend in backends {
            let checker = self.clone();
            let backend_id = backend.id.clone();
            let task = tokio::spawn(async move {
                checker.check_backend(backend).await
            });
            tasks.push((backend_id, task));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for (backend_id, task) in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!("Health check task for {} failed: {}", backend_id, e);
                    results.push(HealthCheckResult {
                        backend_id,
                        healthy: false,
                        response_time_ms: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let healthy_count = results.iter().filter(|r| r.healthy).count();
        let unhealthy_count = results.len() - healthy_count;

        let available = self.pool.healthy_size().await;
        let total = self.pool.size().await;
        if let Some(metrics) = &self.metrics {
            metrics.update_backend_counts(available, total);
        }

        info!(
            "Health check complete: {} passed, {} failed, {}/{} backends available",
            healthy_count, unhealthy_count, available, total
        );

        results
    }

    async fn check_backend(&self, backend: Arc<Backend>) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let url = probe_url(&backend, &self.config.path);

        let result = timeout(
            self.config.timeout(),
            self.client
                .get(&url)
                .header(USER_AGENT, PROBE_USER_AGENT)
                .header(ACCEPT, "*/*")
                .send(),
        )
        .await;

        let response_time_ms = start.elapsed().as_millis() as u64;

        let (healthy, error) = match result {
            Ok(Ok(response)) => {
                let status = response.status();
                if status.as_u16() == self.config.expected_status {
                    (true, None)
                } else {
                    (false, Some(format!("HTTP {}", status)))
                }
            }
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some("Request timeout".to_string())),
        };

        if healthy {
            if backend.mark_healthy().await {
                info!("Backend {} is now healthy", backend.id);
            }
            debug!("Backend {} passed health check in {}ms", backend.id, response_time_ms);
        } else {
            if backend.mark_unhealthy().await {
                let failures = backend.fail_count().await;
                warn!(
                    "Backend {} is now unhealthy after {} consecutive failures: {:?}",
                    backend.id, failures, error
                );
            } else {
                debug!("Backend {} failed health check: {:?}", backend.id, error);
            }
        }

        if let Some(metrics) = &self.metrics {
            let available = backend.is_healthy().await;
            metrics.record_health_check(&backend.id, healthy);
            metrics.update_backend_health(&backend.id, available);
        }

        HealthCheckResult {
            backend_id: backend.id.clone(),
            healthy,
            response_time_ms,
            error,
        }
    }
}

fn probe_url(backend: &Backend, path: &str) -> String {
    format!(
        "{}/{}",
        backend.url.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use std::time::Duration;
    use url::Url;

    fn config(path: &str) -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval_secs: 3600,
            timeout_secs: 2,
            path: path.to_string(),
            expected_status: 200,
        }
    }

    async fn pool_with(urls: &[String], max_fails: u32) -> Arc<BackendPool> {
        let pool = Arc::new(BackendPool::new());
        for url in urls {
            let url = Url::parse(url).unwrap();
            let backend = Backend::new(url, 1, max_fails, Duration::from_secs(60));
            pool.add_backend(Arc::new(backend)).await;
        }
        pool
    }

    fn refused_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    #[test]
    fn test_probe_url_joins_with_single_slash() {
        let b = Backend::new(Url::parse("http://a:1/api/").unwrap(), 1, 1, Duration::from_secs(1));
        assert_eq!(probe_url(&b, "/health"), "http://a:1/api/health");

        let b = Backend::new(Url::parse("http://a:1").unwrap(), 1, 1, Duration::from_secs(1));
        assert_eq!(probe_url(&b, "/health"), "http://a:1/health");
    }

    #[tokio::test]
    async fn test_sweep_marks_unknown_backend_healthy() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .match_header("user-agent", PROBE_USER_AGENT)
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let pool = pool_with(&[server.url()], 3).await;
        let checker = Arc::new(HealthChecker::new(config("/health"), pool.clone(), None).unwrap());

        let results = checker.clone().check_all_backends().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].healthy);

        let backend = &pool.snapshot().await[0];
        assert_eq!(backend.status().await, HealthStatus::Healthy);
        assert!(backend.is_healthy().await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_matching_status_trips_after_max_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;

        let pool = pool_with(&[server.url()], 2).await;
        let backend = pool.snapshot().await[0].clone();
        backend.mark_healthy().await;
        let checker = Arc::new(HealthChecker::new(config("/health"), pool, None).unwrap());

        let results = checker.clone().check_all_backends().await;
        assert!(!results[0].healthy);
        assert_eq!(results[0].error.as_deref(), Some("HTTP 503 Service Unavailable"));
        assert!(backend.is_healthy().await);

        checker.clone().check_all_backends().await;
        assert!(!backend.is_healthy().await);
        assert_eq!(backend.status().await, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_connection_error_counts_as_failure() {
        let pool = pool_with(&[refused_url()], 1).await;
        let checker = Arc::new(HealthChecker::new(config("/health"), pool.clone(), None).unwrap());

        let results = checker.clone().check_all_backends().await;
        assert!(!results[0].healthy);
        assert!(results[0].error.is_some());

        let backend = &pool.snapshot().await[0];
        assert_eq!(backend.status().await, HealthStatus::Unhealthy);
        assert_eq!(backend.fail_count().await, 1);
    }

    #[tokio::test]
    async fn test_custom_expected_status() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/ping").with_status(204).create_async().await;

        let mut cfg = config("/ping");
        cfg.expected_status = 204;
        let pool = pool_with(&[server.url()], 1).await;
        let checker = Arc::new(HealthChecker::new(cfg, pool.clone(), None).unwrap());

        checker.clone().check_all_backends().await;
        assert!(pool.snapshot().await[0].is_healthy().await);
    }

    #[tokio::test]
    async fn test_start_runs_first_sweep_immediately_and_stop_waits() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/health").with_status(200).create_async().await;

        let pool = pool_with(&[server.url()], 1).await;
        let checker = Arc::new(HealthChecker::new(config("/health"), pool.clone(), None).unwrap());

        assert!(checker.start().await);
        assert!(!checker.start().await);

        let backend = pool.snapshot().await[0].clone();
        let became_healthy = timeout(Duration::from_secs(5), async {
            while !backend.is_healthy().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(became_healthy.is_ok(), "first sweep should not wait for the interval");

        timeout(Duration::from_secs(5), checker.stop())
            .await
            .expect("stop should return once the loop exits");
        assert!(checker.task.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_restart_after_stop_keeps_probing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(200)
            .expect_at_least(3)
            .create_async()
            .await;

        let mut cfg = config("/health");
        cfg.interval_secs = 1;
        let pool = pool_with(&[server.url()], 1).await;
        let checker = Arc::new(HealthChecker::new(cfg, pool, None).unwrap());

        assert!(checker.start().await);
        checker.stop().await;
        assert!(checker.start().await);

        // Immediate sweep plus the ticks at 1s and 2s
        tokio::time::sleep(Duration::from_millis(2500)).await;
        {
            let task = checker.task.lock().await;
            assert!(!task.as_ref().unwrap().is_finished(), "restarted loop exited early");
        }

        checker.stop().await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_slow_backend_times_out_without_delaying_others() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let slow_url = format!("http://{}", listener.local_addr().unwrap());
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/health").with_status(200).create_async().await;

        let mut cfg = config("/health");
        cfg.timeout_secs = 1;
        let pool = pool_with(&[slow_url, server.url()], 1).await;
        let checker = Arc::new(HealthChecker::new(cfg, pool.clone(), None).unwrap());

        let start = std::time::Instant::now();
        let results = checker.clone().check_all_backends().await;
        let elapsed = start.elapsed();

        assert!(elapsed < Duration::from_secs(2), "sweep took {:?}", elapsed);
        assert!(!results[0].healthy);
        assert!(results[0].error.is_some());
        assert!(results[1].healthy);

        let backends = pool.snapshot().await;
        assert_eq!(backends[0].status().await, HealthStatus::Unhealthy);
        assert_eq!(backends[1].status().await, HealthStatus::Healthy);

        hold.abort();
    }

    #[tokio::test]
    async fn test_disabled_checker_never_probes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let mut cfg = config("/health");
        cfg.enabled = false;
        let pool = pool_with(&[server.url()], 1).await;
        let checker = Arc::new(HealthChecker::new(cfg, pool.clone(), None).unwrap());

        assert!(!checker.start().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        checker.stop().await;

        assert_eq!(pool.snapshot().await[0].status().await, HealthStatus::Unknown);
        mock.assert_async().await;
    }
}
