use crate::error::{Result, StepwiseError};
use crate::orchestration::EngineSettings;
use crate::types::DEFAULT_TENANT;
use crate::webhook::SubscriptionDraft;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory when none is named.
pub const DEFAULT_CONFIG_FILE: &str = "stepwise.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SessionsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
}

fn default_session_ttl() -> u64 {
    300
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
        }
    }
}

impl SessionsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// OrchestrationsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationsConfig {
    #[serde(default = "default_orchestration_ttl")]
    pub ttl_secs: u64,
    /// How long records outlive their deadline or terminal status.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

fn default_orchestration_ttl() -> u64 {
    1800
}

fn default_retention() -> u64 {
    3600
}

impl Default for OrchestrationsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_orchestration_ttl(),
            retention_secs: default_retention(),
        }
    }
}

impl OrchestrationsConfig {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            ttl: Duration::from_secs(self.ttl_secs),
            retention: Duration::from_secs(self.retention_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// WebhooksConfig
// ---------------------------------------------------------------------------

/// A subscription created at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSeed {
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(flatten)]
    pub subscription: SubscriptionDraft,
}

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    /// Total delivery attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before each retry; the last entry repeats if attempts outnumber
    /// delays.
    #[serde(default = "default_retry_delays")]
    pub retry_delays_ms: Vec<u64>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscriptions: Vec<SubscriptionSeed>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delays() -> Vec<u64> {
    vec![1000, 5000]
}

fn default_webhook_timeout() -> u64 {
    10
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delays_ms: default_retry_delays(),
            timeout_secs: default_webhook_timeout(),
            subscriptions: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Redb { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(flatten)]
    pub backend: StoreBackend,
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

fn default_purge_interval() -> u64 {
    60
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            purge_interval_secs: default_purge_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Sessions are managed in-process and completed through the API.
    #[default]
    Local,
    Http {
        base_url: String,
        #[serde(default = "default_provider_timeout")]
        timeout_secs: u64,
    },
}

fn default_provider_timeout() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub orchestrations: OrchestrationsConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StepwiseError::ConfigNotFound(path.display().to_string()));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Load `path` if given; otherwise `stepwise.yaml` in the working
    /// directory if present, else defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level, message: String| warnings.push(ConfigWarning { level, message });

        if self.sessions.ttl_secs == 0 {
            push(WarnLevel::Error, "sessions.ttl_secs must be > 0".into());
        }
        if self.orchestrations.ttl_secs == 0 {
            push(WarnLevel::Error, "orchestrations.ttl_secs must be > 0".into());
        }
        if self.orchestrations.ttl_secs > 0
            && self.orchestrations.ttl_secs < self.sessions.ttl_secs
        {
            push(
                WarnLevel::Warning,
                format!(
                    "orchestrations.ttl_secs ({}) is shorter than one verification session ({})",
                    self.orchestrations.ttl_secs, self.sessions.ttl_secs
                ),
            );
        }

        let hooks = &self.webhooks;
        if hooks.max_attempts == 0 {
            push(WarnLevel::Error, "webhooks.max_attempts must be >= 1".into());
        }
        if hooks.max_attempts > 1 && hooks.retry_delays_ms.is_empty() {
            push(
                WarnLevel::Error,
                "webhooks.retry_delays_ms is empty but retries are enabled".into(),
            );
        }
        let retries = hooks.max_attempts.saturating_sub(1) as usize;
        if !hooks.retry_delays_ms.is_empty() && retries > hooks.retry_delays_ms.len() {
            push(
                WarnLevel::Warning,
                format!(
                    "webhooks.max_attempts ({}) needs {retries} retry delays but {} are set; \
                     the last delay repeats",
                    hooks.max_attempts,
                    hooks.retry_delays_ms.len()
                ),
            );
        }
        if hooks.retry_delays_ms.windows(2).any(|w| w[1] <= w[0]) {
            push(
                WarnLevel::Warning,
                "webhooks.retry_delays_ms should be strictly increasing".into(),
            );
        }
        if hooks.timeout_secs == 0 {
            push(WarnLevel::Error, "webhooks.timeout_secs must be > 0".into());
        }
        for (i, seed) in hooks.subscriptions.iter().enumerate() {
            let sub = &seed.subscription;
            if !(sub.url.starts_with("http://") || sub.url.starts_with("https://")) {
                push(
                    WarnLevel::Error,
                    format!("webhooks.subscriptions[{i}]: url must be http(s)"),
                );
            }
            if sub.events.is_empty() {
                push(
                    WarnLevel::Error,
                    format!("webhooks.subscriptions[{i}]: no events"),
                );
            }
            if sub.secret.is_none() {
                push(
                    WarnLevel::Warning,
                    format!(
                        "webhooks.subscriptions[{i}]: no secret; a random one will be generated at startup"
                    ),
                );
            }
        }

        if self.store.purge_interval_secs == 0 {
            push(WarnLevel::Error, "store.purge_interval_secs must be > 0".into());
        }

        if let ProviderConfig::Http { base_url, .. } = &self.provider {
            if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                push(
                    WarnLevel::Error,
                    format!("provider.base_url must be http(s): '{base_url}'"),
                );
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
