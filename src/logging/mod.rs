// src/logging/mod.rs
use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Target for per-request access events, filterable on its own via `RUST_LOG`.
pub const ACCESS_LOG_TARGET: &str = "bolt_lb::access";

/// Install the global subscriber. `RUST_LOG`, when set, replaces the configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)));

    let fmt_layer = match config.format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false)
            .boxed(),
        _ => fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

fn default_directives(level: &str) -> String {
    format!("warn,bolt_lb={},hyper=info", level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_parse() {
        let directives = default_directives("debug");
        assert_eq!(directives, "warn,bolt_lb=debug,hyper=info");
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}
