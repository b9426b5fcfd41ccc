// src/config/models.rs
use crate::load_balancer;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_FAILS: u32 = 3;
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["text", "json"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file '{0}' does not exist")]
    NotFound(String),

    #[error("failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid server port {0}: port must be between 1 and 65535")]
    InvalidPort(u32),

    #[error("at least one backend must be configured")]
    NoBackends,

    #[error("backend {0}: URL cannot be empty")]
    EmptyBackendUrl(usize),

    #[error("backend {index}: malformed URL '{url}': {reason}")]
    InvalidBackendUrl {
        index: usize,
        url: String,
        reason: String,
    },

    #[error(
        "invalid load balancing strategy '{0}' (supported: {})",
        load_balancer::supported_algorithms().join(", ")
    )]
    InvalidStrategy(String),

    #[error("failed to parse {name} from environment: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backends: Vec<BackendConfig>,
    pub strategy: String,
    pub health_check: HealthCheckConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            backends: vec![BackendConfig::new("http://localhost:8081")],
            strategy: "round_robin".to_string(),
            health_check: HealthCheckConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Parse a YAML document, filling omitted fields with defaults, then clamp and validate.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(contents)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub async fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = self.to_yaml()?;
        tokio::fs::write(path, contents)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    /// Range-clamp values the core must never see as zero or unknown.
    pub fn normalize(&mut self) {
        if self.server.request_timeout_secs == 0 {
            self.server.request_timeout_secs = DEFAULT_TIMEOUT_SECS;
        }

        for backend in &mut self.backends {
            backend.url = backend.url.trim().to_string();
            if backend.weight == 0 {
                backend.weight = 1;
            }
            if backend.max_fails == 0 {
                backend.max_fails = DEFAULT_MAX_FAILS;
            }
            if backend.fail_timeout_secs == 0 {
                backend.fail_timeout_secs = DEFAULT_TIMEOUT_SECS;
            }
        }

        let hc = &mut self.health_check;
        if hc.interval_secs == 0 {
            hc.interval_secs = DEFAULT_TIMEOUT_SECS;
        }
        if hc.timeout_secs == 0 {
            hc.timeout_secs = DEFAULT_TIMEOUT_SECS;
        }
        if !hc.path.starts_with('/') {
            hc.path.insert(0, '/');
        }
        if !(100..=599).contains(&hc.expected_status) {
            hc.expected_status = 200;
        }

        self.logging.level = self.logging.level.trim().to_ascii_lowercase();
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            self.logging.level = "info".to_string();
        }
        self.logging.format = self.logging.format.trim().to_ascii_lowercase();
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            self.logging.format = "text".to_string();
        }

        if !self.metrics.path.starts_with('/') {
            self.metrics.path.insert(0, '/');
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=65535).contains(&self.server.port) {
            return Err(ConfigError::InvalidPort(self.server.port));
        }

        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }

        for (index, backend) in self.backends.iter().enumerate() {
            backend.parse_url(index)?;
        }

        if !load_balancer::is_supported(&self.strategy) {
            return Err(ConfigError::InvalidStrategy(self.strategy.clone()));
        }

        Ok(())
    }

    /// `LB_PORT` and `LB_HOST` take precedence over the file.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var("LB_PORT") {
            if !port.is_empty() {
                self.server.port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    name: "LB_PORT",
                    value: port.clone(),
                })?;
            }
        }

        if let Ok(host) = std::env::var("LB_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }

        self.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u32,
    /// Upper bound for one proxied upstream exchange.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,
    #[serde(default = "default_fail_timeout_secs")]
    pub fail_timeout_secs: u64,
}

fn default_weight() -> u32 {
    1
}

fn default_max_fails() -> u32 {
    DEFAULT_MAX_FAILS
}

fn default_fail_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl BackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            weight: default_weight(),
            max_fails: default_max_fails(),
            fail_timeout_secs: default_fail_timeout_secs(),
        }
    }

    pub fn fail_timeout(&self) -> Duration {
        Duration::from_secs(self.fail_timeout_secs)
    }

    /// Parse the configured URL, defaulting the scheme to `http`.
    pub fn parse_url(&self, index: usize) -> Result<Url, ConfigError> {
        let raw = self.url.trim();
        if raw.is_empty() {
            return Err(ConfigError::EmptyBackendUrl(index));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };

        let invalid = |reason: String| ConfigError::InvalidBackendUrl {
            index,
            url: raw.to_string(),
            reason,
        };

        let url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }

        Ok(url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub path: String,
    pub expected_status: u16,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 5,
            path: "/health".to_string(),
            expected_status: 200,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub access_log: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            access_log: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}
