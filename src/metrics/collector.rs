// src/metrics/collector.rs
use anyhow::Result;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Request metrics
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,

    // Backend metrics
    pub backend_requests_total: IntCounterVec,
    pub backend_request_duration_seconds: HistogramVec,
    pub backend_health_status: IntGaugeVec,
    pub health_checks_total: IntCounterVec,

    // Pool metrics
    pub healthy_backends: IntGauge,
    pub total_backends: IntGauge,
}

// Upstream latencies: sub-millisecond loopback up to the default 30s request timeout
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn register<M>(registry: &Registry, metric: M) -> Result<M>
where
    M: Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn latency_opts(name: &str, help: &str) -> HistogramOpts {
    HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec())
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            requests_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("lb_requests_total", "Requests answered by the load balancer"),
                    &["method", "status_code", "backend"],
                )?,
            )?,
            request_duration_seconds: register(
                registry,
                HistogramVec::new(
                    latency_opts("lb_request_duration_seconds", "End-to-end request duration"),
                    &["method", "status_code", "backend"],
                )?,
            )?,
            backend_requests_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("lb_backend_requests_total", "Forwarded requests by outcome"),
                    &["backend", "status"],
                )?,
            )?,
            backend_request_duration_seconds: register(
                registry,
                HistogramVec::new(
                    latency_opts(
                        "lb_backend_request_duration_seconds",
                        "Upstream exchange duration",
                    ),
                    &["backend"],
                )?,
            )?,
            backend_health_status: register(
                registry,
                IntGaugeVec::new(
                    Opts::new(
                        "lb_backend_health_status",
                        "Backend availability after the last probe (1=available, 0=not)",
                    ),
                    &["backend"],
                )?,
            )?,
            health_checks_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("lb_health_checks_total", "Active health probes by outcome"),
                    &["backend", "result"],
                )?,
            )?,
            healthy_backends: register(
                registry,
                IntGauge::new("lb_healthy_backends", "Backends currently available")?,
            )?,
            total_backends: register(
                registry,
                IntGauge::new("lb_total_backends", "Configured backends")?,
            )?,
        })
    }

    /// `backend` is "-" when the request never reached an upstream.
    pub fn record_request(
        &self,
        method: &str,
        status_code: u16,
        backend: &str,
        duration: Duration,
    ) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[method, &status, backend])
            .inc();

        self.request_duration_seconds
            .with_label_values(&[method, &status, backend])
            .observe(duration.as_secs_f64());
    }

    pub fn record_backend_request(&self, backend: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "failure" };
        self.backend_requests_total
            .with_label_values(&[backend, status])
            .inc();

        self.backend_request_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn record_health_check(&self, backend: &str, passed: bool) {
        let result = if passed { "pass" } else { "fail" };
        self.health_checks_total
            .with_label_values(&[backend, result])
            .inc();
    }

    pub fn update_backend_health(&self, backend: &str, available: bool) {
        self.backend_health_status
            .with_label_values(&[backend])
            .set(i64::from(available));
    }

    pub fn update_backend_counts(&self, healthy: usize, total: usize) {
        self.healthy_backends.set(healthy as i64);
        self.total_backends.set(total as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_exposes_recorded_values() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.collector();

        metrics.update_backend_counts(2, 3);
        metrics.record_request("GET", 503, "-", Duration::from_millis(3));
        metrics.record_health_check("a:8081", false);

        let text = String::from_utf8(registry.gather().unwrap()).unwrap();
        assert!(text.contains("lb_healthy_backends 2"));
        assert!(text.contains("lb_total_backends 3"));
        assert!(text.contains("lb_request_duration_seconds_bucket"));
        let request_line = text
            .lines()
            .find(|l| l.starts_with("lb_requests_total{"))
            .unwrap();
        assert!(request_line.contains("status_code=\"503\""));
        assert!(request_line.ends_with(" 1"));

        let probe_line = text
            .lines()
            .find(|l| l.starts_with("lb_health_checks_total{"))
            .unwrap();
        assert!(probe_line.contains("result=\"fail\""));
    }
}
