use crate::control_plane::RetryPolicy;
use crate::error::Result;
use crate::paths;
use crate::watcher::WatchSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

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
// ControlPlaneConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "http://localhost:8080".to_string()
}

fn default_token_env() -> String {
    "ROLLOUT_API_TOKEN".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            token_env: default_token_env(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Bearer token from the configured environment variable, if set and non-empty.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// RolloutConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Container updated when `deploy` is not given `--container`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_container: Option<String>,
    #[serde(default)]
    pub auto_rollback: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_confirmations")]
    pub stable_confirmations: u32,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_timeout() -> u64 {
    600
}

fn default_confirmations() -> u32 {
    1
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            default_container: None,
            auto_rollback: false,
            poll_interval_secs: default_poll_interval(),
            timeout_secs: default_timeout(),
            stable_confirmations: default_confirmations(),
        }
    }
}

impl RolloutConfig {
    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            stable_confirmations: self.stable_confirmations,
        }
    }
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    4
}

fn default_base_delay() -> u64 {
    200
}

fn default_max_delay() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            control_plane: ControlPlaneConfig::default(),
            rollout: RolloutConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Load `.rollout/config.yaml` under `root`, or defaults when it is absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let rollout = &self.rollout;

        if self.control_plane.endpoint.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "control_plane.endpoint is empty".to_string(),
            });
        } else if !self.control_plane.endpoint.starts_with("http://")
            && !self.control_plane.endpoint.starts_with("https://")
        {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "control_plane.endpoint '{}' is not an http(s) URL",
                    self.control_plane.endpoint
                ),
            });
        }

        if self.control_plane.request_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "control_plane.request_timeout_secs must be at least 1".to_string(),
            });
        }

        if rollout.poll_interval_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "rollout.poll_interval_secs must be at least 1".to_string(),
            });
        }

        if rollout.timeout_secs < rollout.poll_interval_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "rollout.timeout_secs ({}) is shorter than poll_interval_secs ({}); only one poll will run",
                    rollout.timeout_secs, rollout.poll_interval_secs
                ),
            });
        }

        if rollout.stable_confirmations == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "rollout.stable_confirmations is 0; treated as 1".to_string(),
            });
        } else if u64::from(rollout.stable_confirmations) * rollout.poll_interval_secs
            > rollout.timeout_secs
        {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "{} confirmations at {}s intervals cannot complete within {}s",
                    rollout.stable_confirmations, rollout.poll_interval_secs, rollout.timeout_secs
                ),
            });
        }

        if self.retry.max_retries > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "retry.max_retries = {} may stall a rollout on a failing control plane",
                    self.retry.max_retries
                ),
            });
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "retry.base_delay_ms exceeds retry.max_delay_ms".to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
