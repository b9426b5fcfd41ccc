// src/config/mod.rs
mod models;

pub use models::*;

use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Load configuration from a file (YAML or JSON)
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let display = path.display().to_string();

    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(display));
        }
        Err(source) => return Err(ConfigError::Io { path: display, source }),
    };

    let is_yaml = matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    );

    let mut config: Config = if is_yaml {
        serde_yaml::from_str(&contents)?
    } else {
        serde_json::from_str(&contents)?
    };

    config.normalize();
    config.validate()?;
    Ok(config)
}

/// Resolve the startup configuration: file (or defaults when the default file is absent),
/// then environment overrides. Runs before logging is up, so it logs nothing.
pub async fn load_startup_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    let mut config = match load_config(path).await {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) if path == Path::new(DEFAULT_CONFIG_FILE) => {
            Config::default()
        }
        Err(e) => return Err(e),
    };

    config.apply_env_overrides()?;
    Ok(config)
}
