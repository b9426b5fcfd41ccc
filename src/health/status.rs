// src/health/status.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one backend, as reported by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendReport {
    pub id: String,
    pub url: String,
    pub status: HealthStatus,
    /// Effective availability, including cooldown expiry.
    pub available: bool,
    pub weight: u32,
    pub fail_count: u32,
    pub max_fails: u32,
    pub fail_timeout_secs: u64,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub healthy_backends: usize,
    pub total_backends: usize,
    pub algorithm: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub backends: Vec<BackendReport>,
}

/// Body and verdict of `GET /health`.
pub fn health_summary(healthy: usize, total: usize) -> (bool, String) {
    if healthy == 0 {
        (false, format!("UNHEALTHY: 0/{} backends available", total))
    } else {
        (true, format!("HEALTHY: {}/{} backends available", healthy, total))
    }
}
