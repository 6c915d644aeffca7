// Configuration - YAML file with environment overrides for secrets
// 配置模块 - YAML 配置文件，密钥可由环境变量覆盖

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::platforms::common::PollConfig;

pub const DEVELOPER_TOKEN_ENV: &str = "GOOGLE_ADS_DEVELOPER_TOKEN";
pub const LOGIN_CUSTOMER_ENV: &str = "GOOGLE_ADS_LOGIN_CUSTOMER_ID";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub log_level: String,
    pub http_timeout_secs: u64,
    pub media: MediaSettings,
    pub google_ads: GoogleAdsSettings,
    pub throttle: ThrottleSettings,
    pub polling: PollingSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/dispatch.db"),
            log_level: "info".to_string(),
            http_timeout_secs: 60,
            media: MediaSettings::default(),
            google_ads: GoogleAdsSettings::default(),
            throttle: ThrottleSettings::default(),
            polling: PollingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    pub storage_root: PathBuf,
    pub public_base_url: Option<String>,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("storage"),
            public_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GoogleAdsSettings {
    pub developer_token: Option<String>,
    pub login_customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    pub enabled: bool,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Optional overrides applied to every publisher's readiness polls
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

impl PollingSettings {
    /// Apply the overrides on top of a platform default
    pub fn apply(&self, base: PollConfig) -> PollConfig {
        PollConfig {
            interval: self
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(base.interval),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
        }
    }
}

impl AppConfig {
    /// Load from a YAML file; a missing file yields defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                tracing::info!("[Config] loading {:?}", path);
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            Some(path) => {
                tracing::warn!("[Config] {:?} not found, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Secrets from the environment win over the file
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(DEVELOPER_TOKEN_ENV).filter(|t| !t.trim().is_empty()) {
            self.google_ads.developer_token = Some(token);
        }
        if let Some(id) = lookup(LOGIN_CUSTOMER_ENV).filter(|t| !t.trim().is_empty()) {
            self.google_ads.login_customer_id = Some(id);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "http_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.polling.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "polling.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
