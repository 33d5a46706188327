use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Project identifier used when neither the config nor the environment names one.
pub const DEFAULT_PROJECT_ID: &str = "local-project";

/// Environment variable overriding `broker.project_id`.
pub const PROJECT_ID_ENV: &str = "PUBSUB_PROJECT_ID";

/// Environment variable setting `broker.emulator_host`.
pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub client: ClientConfig,
    pub broker: BrokerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 3000,
        }
    }
}

/// Registry store policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Records whose last heartbeat is older than this are evicted
    pub stale_after_secs: u64,
    /// Period of the background sweep; 0 disables it
    pub sweep_interval_secs: u64,
    /// Sweep stale records before answering `GET /health`
    pub sweep_on_health_check: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 60,
            sweep_interval_secs: 30,
            sweep_on_health_check: true,
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Settings for services talking to the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub registry_url: String,
    pub heartbeat_interval_secs: u64,
    /// Per-request timeout. Unset means the transport default.
    pub request_timeout_secs: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registry_url: "http://localhost:3000".to_string(),
            heartbeat_interval_secs: 30,
            request_timeout_secs: None,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Memory,
    Redis,
}

/// Event bus broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    /// Namespace for topics and subscriptions
    pub project_id: String,
    /// Endpoint override (host:port), takes precedence over `redis_url`
    pub emulator_host: Option<String>,
    pub redis_url: String,
    /// Upper bound on concurrently running handlers per subscription
    pub max_outstanding_messages: usize,
    /// Delay before a nacked message becomes visible again
    pub redelivery_delay_ms: u64,
    /// Stable consumer name within Redis consumer groups. A restarted
    /// process with the same name resumes its own pending entries.
    pub consumer_name: Option<String>,
    /// Idle time after which entries pending on another consumer are claimed
    pub claim_idle_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Memory,
            project_id: DEFAULT_PROJECT_ID.to_string(),
            emulator_host: None,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_outstanding_messages: 100,
            redelivery_delay_ms: 0,
            consumer_name: None,
            claim_idle_secs: 60,
        }
    }
}

impl BrokerConfig {
    /// Endpoint the Redis backend connects to.
    #[must_use]
    pub fn endpoint(&self) -> String {
        match self.emulator_host.as_deref() {
            Some(host) if host.contains("://") => host.to_string(),
            Some(host) => format!("redis://{host}"),
            None => self.redis_url.clone(),
        }
    }

    #[must_use]
    pub const fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    #[must_use]
    pub const fn claim_idle(&self) -> Duration {
        Duration::from_secs(self.claim_idle_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then `BEACON_*` environment
    /// variables (`BEACON_BROKER__PROJECT_ID`, ...), then the `PUBSUB_*` overrides.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("BEACON")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder = builder
            .set_override_option("broker.project_id", std::env::var(PROJECT_ID_ENV).ok())?
            .set_override_option("broker.emulator_host", std::env::var(EMULATOR_HOST_ENV).ok())?;

        builder.build()?.try_deserialize()
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.broker.project_id.trim().is_empty() {
            errors.push("broker.project_id must not be empty".to_string());
        }
        if self.broker.max_outstanding_messages == 0 {
            errors.push("broker.max_outstanding_messages must be at least 1".to_string());
        }
        if self.broker.claim_idle_secs == 0 {
            errors.push("broker.claim_idle_secs must be at least 1".to_string());
        }
        if self
            .broker
            .consumer_name
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            errors.push("broker.consumer_name must not be blank".to_string());
        }
        if self.client.heartbeat_interval_secs == 0 {
            errors.push("client.heartbeat_interval_secs must be at least 1".to_string());
        }
        if self.registry.stale_after_secs == 0 {
            errors.push("registry.stale_after_secs must be at least 1".to_string());
        }
        if let Err(e) = url::Url::parse(&self.client.registry_url) {
            errors.push(format!(
                "client.registry_url '{}' is not a valid URL: {e}",
                self.client.registry_url
            ));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
