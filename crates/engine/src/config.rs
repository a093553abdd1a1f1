//! Engine configuration loading and validation.
//!
//! All values have library defaults; deployments that configure through the
//! environment use [`EngineConfig::from_env`] and get a clear error message
//! for any invalid value.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Validated engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Expiry of data-encryption-key cache entries, in seconds.
    #[serde(default = "default_settings_ttl")]
    pub settings_ttl_secs: u64,

    /// Per-request timeout for key-vault HTTP calls, in seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Base backoff between AAD token retry attempts, in milliseconds.
    #[serde(default = "default_aad_retry_interval")]
    pub aad_retry_interval_ms: u64,

    /// Maximum retry attempts for AAD token acquisition.
    #[serde(default = "default_aad_retry_count")]
    pub aad_retry_count: u32,

    /// Key-vault REST API version query parameter.
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_settings_ttl() -> u64 {
    3600
}
fn default_http_timeout() -> u64 {
    60
}
fn default_aad_retry_interval() -> u64 {
    1000
}
fn default_aad_retry_count() -> u32 {
    3
}
fn default_api_version() -> String {
    "7.4".into()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settings_ttl_secs: default_settings_ttl(),
            http_timeout_secs: default_http_timeout(),
            aad_retry_interval_ms: default_aad_retry_interval(),
            aad_retry_count: default_aad_retry_count(),
            api_version: default_api_version(),
        }
    }
}

impl EngineConfig {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: EngineConfig = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<()> {
        if self.settings_ttl_secs == 0 {
            anyhow::bail!("SETTINGS_TTL_SECS must be > 0");
        }
        if self.http_timeout_secs == 0 {
            anyhow::bail!("HTTP_TIMEOUT_SECS must be > 0");
        }
        if self.api_version.trim().is_empty() {
            anyhow::bail!("API_VERSION is required and must not be empty");
        }
        Ok(())
    }

    /// Cache-entry TTL as a [`Duration`].
    pub fn settings_ttl(&self) -> Duration {
        Duration::from_secs(self.settings_ttl_secs)
    }

    /// Key-vault request timeout as a [`Duration`].
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// AAD retry base interval as a [`Duration`].
    pub fn aad_retry_interval(&self) -> Duration {
        Duration::from_millis(self.aad_retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_correct() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.settings_ttl_secs, 3600);
        assert_eq!(cfg.http_timeout_secs, 60);
        assert_eq!(cfg.aad_retry_interval_ms, 1000);
        assert_eq!(cfg.aad_retry_count, 3);
        assert_eq!(cfg.api_version, "7.4");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_ttl() {
        let cfg = EngineConfig {
            settings_ttl_secs: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let cfg = EngineConfig {
            http_timeout_secs: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_api_version() {
        let cfg = EngineConfig {
            api_version: "  ".into(),
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duration_accessors() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.settings_ttl(), Duration::from_secs(3600));
        assert_eq!(cfg.aad_retry_interval(), Duration::from_millis(1000));
    }
}
