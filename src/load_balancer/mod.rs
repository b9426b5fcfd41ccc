// src/load_balancer/mod.rs
mod round_robin;
mod algorithm;

pub use algorithm::{LoadBalancer, UnsupportedAlgorithm};
pub use round_robin::RoundRobinBalancer;

use std::sync::Arc;

const SUPPORTED_ALGORITHMS: &[&str] = &["round_robin"];

pub fn supported_algorithms() -> &'static [&'static str] {
    SUPPORTED_ALGORITHMS
}

pub fn is_supported(name: &str) -> bool {
    SUPPORTED_ALGORITHMS.contains(&name)
}

/// Unknown names fail here, at startup, never at request time.
pub fn create_load_balancer(name: &str) -> Result<Arc<dyn LoadBalancer>, UnsupportedAlgorithm> {
    match name {
        "round_robin" => Ok(Arc::new(RoundRobinBalancer::new())),
        other => Err(UnsupportedAlgorithm(other.to_string())),
    }
}
