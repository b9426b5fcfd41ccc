// src/proxy/backend.rs
use crate::config::{BackendConfig, ConfigError};
use crate::health::{BackendReport, HealthStatus};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use url::Url;

#[derive(Debug)]
struct HealthState {
    status: HealthStatus,
    fail_count: u32,
    last_fail_time: Option<Instant>,
    last_health_check: Option<DateTime<Utc>>,
}

impl HealthState {
    /// Unhealthy is a self-expiring penalty box: once `fail_timeout` has passed since the
    /// last failure the backend is offered traffic again, with or without a passing probe.
    /// This fail-open cooldown is intentional. With active checks disabled it can keep
    /// cycling a persistently broken backend back into rotation.
    fn is_available(&self, fail_timeout: Duration) -> bool {
        match self.status {
            HealthStatus::Healthy => true,
            HealthStatus::Unknown => false,
            HealthStatus::Unhealthy => self
                .last_fail_time
                .map_or(false, |at| at.elapsed() > fail_timeout),
        }
    }
}

/// One upstream target. All health fields live behind a single per-backend lock.
#[derive(Debug)]
pub struct Backend {
    pub id: String,
    pub url: Url,
    /// Reported only; round robin ignores it.
    pub weight: u32,
    pub max_fails: u32,
    pub fail_timeout: Duration,

    state: RwLock<HealthState>,
}

impl Backend {
    pub fn new(url: Url, weight: u32, max_fails: u32, fail_timeout: Duration) -> Self {
        let id = format!(
            "{}:{}",
            url.host_str().unwrap_or("unknown"),
            url.port_or_known_default().unwrap_or(80)
        );

        Self {
            id,
            url,
            weight,
            max_fails: max_fails.max(1),
            fail_timeout,
            state: RwLock::new(HealthState {
                status: HealthStatus::Unknown,
                fail_count: 0,
                last_fail_time: None,
                last_health_check: None,
            }),
        }
    }

    pub fn from_config(index: usize, config: &BackendConfig) -> Result<Self, ConfigError> {
        let url = config.parse_url(index)?;
        Ok(Self::new(url, config.weight, config.max_fails, config.fail_timeout()))
    }

    pub async fn is_healthy(&self) -> bool {
        self.state.read().await.is_available(self.fail_timeout)
    }

    /// Returns true when this call moved the backend into `Healthy`.
    pub async fn mark_healthy(&self) -> bool {
        let mut state = self.state.write().await;
        let changed = state.status != HealthStatus::Healthy;

        state.status = HealthStatus::Healthy;
        state.fail_count = 0;
        state.last_health_check = Some(Utc::now());
        changed
    }

    /// Records one failure. Status only flips once `max_fails` consecutive failures have
    /// accumulated; returns true when this call tripped it.
    pub async fn mark_unhealthy(&self) -> bool {
        let mut state = self.state.write().await;

        state.fail_count = state.fail_count.saturating_add(1);
        state.last_fail_time = Some(Instant::now());

        if state.fail_count >= self.max_fails {
            let tripped = state.status != HealthStatus::Unhealthy;
            state.status = HealthStatus::Unhealthy;
            tripped
        } else {
            false
        }
    }

    pub async fn status(&self) -> HealthStatus {
        self.state.read().await.status
    }

    pub async fn fail_count(&self) -> u32 {
        self.state.read().await.fail_count
    }

    pub async fn report(&self) -> BackendReport {
        let state = self.state.read().await;
        BackendReport {
            id: self.id.clone(),
            url: self.url.to_string(),
            status: state.status,
            available: state.is_available(self.fail_timeout),
            weight: self.weight,
            fail_count: state.fail_count,
            max_fails: self.max_fails,
            fail_timeout_secs: self.fail_timeout.as_secs(),
            last_health_check: state.last_health_check,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(max_fails: u32, fail_timeout: Duration) -> Backend {
        Backend::new(
            Url::parse("http://backend1:8080").unwrap(),
            1,
            max_fails,
            fail_timeout,
        )
    }

    #[tokio::test]
    async fn test_new_backend_is_unknown_and_unavailable() {
        let b = backend(3, Duration::from_secs(30));
        assert_eq!(b.id, "backend1:8080");
        assert_eq!(b.status().await, HealthStatus::Unknown);
        assert!(!b.is_healthy().await);
    }

    #[tokio::test]
    async fn test_failures_below_threshold_keep_backend_healthy() {
        let b = backend(3, Duration::from_secs(30));
        assert!(b.mark_healthy().await);

        assert!(!b.mark_unhealthy().await);
        assert!(!b.mark_unhealthy().await);
        assert_eq!(b.fail_count().await, 2);
        assert!(b.is_healthy().await);
        assert_eq!(b.status().await, HealthStatus::Healthy);

        assert!(b.mark_unhealthy().await);
        assert!(!b.is_healthy().await);
        assert_eq!(b.status().await, HealthStatus::Unhealthy);

        // Further failures don't count as a new trip
        assert!(!b.mark_unhealthy().await);
    }

    #[tokio::test]
    async fn test_mark_healthy_resets_fail_count() {
        let b = backend(3, Duration::from_secs(30));
        b.mark_unhealthy().await;
        b.mark_unhealthy().await;
        b.mark_healthy().await;
        assert_eq!(b.fail_count().await, 0);

        b.mark_unhealthy().await;
        b.mark_unhealthy().await;
        assert!(b.is_healthy().await);
    }

    #[tokio::test]
    async fn test_unknown_backend_failing_below_threshold_stays_unknown() {
        let b = backend(2, Duration::from_secs(30));
        b.mark_unhealthy().await;
        assert_eq!(b.status().await, HealthStatus::Unknown);
        assert!(!b.is_healthy().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_expires_after_fail_timeout() {
        let b = backend(1, Duration::from_secs(10));
        b.mark_healthy().await;
        b.mark_unhealthy().await;
        assert!(!b.is_healthy().await);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!b.is_healthy().await);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(b.is_healthy().await);
        // Derived, not stored
        assert_eq!(b.status().await, HealthStatus::Unhealthy);

        // A fresh failure restarts the cooldown
        b.mark_unhealthy().await;
        assert!(!b.is_healthy().await);
    }

    #[tokio::test]
    async fn test_report() {
        let b = backend(3, Duration::from_secs(30));
        b.mark_healthy().await;
        b.mark_unhealthy().await;

        let report = b.report().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.available);
        assert_eq!(report.fail_count, 1);
        assert_eq!(report.max_fails, 3);
        assert!(report.last_health_check.is_some());
        assert_eq!(report.url, "http://backend1:8080/");
    }
}
