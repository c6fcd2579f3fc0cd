//! Configuration types for the updater core

use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::content::AppId;
use crate::error::{Result, UpdaterError};
use crate::session::{CredentialSource, Credentials};

/// Dedicated server application that depot updates target
pub const SERVER_APP_ID: AppId = 233780;
/// Application (and depot) that hosts workshop item manifests
pub const WORKSHOP_APP_ID: AppId = 107410;

/// Configuration for sessions, downloads and the reference HTTP backend
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub server_app_id: AppId,
    pub workshop_app_id: AppId,
    /// How often a running transfer is polled for completion or cancellation
    pub poll_interval: Duration,
    /// Logon attempts handed to the transport before giving up
    pub max_logon_attempts: u32,
    /// Parallel file fetches inside one content client
    pub content_workers: usize,
    /// Workshop items downloaded concurrently in batch mode
    pub batch_workers: usize,
    /// Use `finished / total * 100` for batch progress instead of the historical formula
    pub normalized_batch_progress: bool,
    /// Where the transport keeps per-user auth artifacts (`<username>.key`)
    pub auth_dir: Option<PathBuf>,
    /// Base URL of the reference HTTP content backend
    pub cdn_url: String,
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Retries for idempotent backend requests (manifests, depot lists, files)
    pub request_retries: usize,
    /// Initial delay between retries (doubles each retry)
    pub retry_delay: Duration,
    /// Maximum retry delay cap
    pub max_retry_delay: Duration,
}

impl UpdaterConfig {
    pub fn builder() -> UpdaterConfigBuilder {
        UpdaterConfigBuilder::new()
    }

    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_workers == 0 {
            return Err(invalid("batch worker count must be at least 1", "batch_workers"));
        }
        if self.content_workers == 0 {
            return Err(invalid("content worker count must be at least 1", "content_workers"));
        }
        if self.max_logon_attempts == 0 {
            return Err(invalid("at least one logon attempt is required", "max_logon_attempts"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll interval must be greater than zero", "poll_interval"));
        }
        Ok(())
    }

    /// Calculate retry delay for the given attempt using exponential backoff
    pub fn get_retry_delay(&self, attempt: usize) -> Duration {
        let delay = (self.retry_delay.as_millis() as u64).saturating_mul(2_u64.saturating_pow(attempt as u32));
        Duration::from_millis(delay.min(self.max_retry_delay.as_millis() as u64))
    }

    /// Build a configuration from `UPDATER_*` environment variables (and `.env` if present)
    ///
    /// Unset or unparseable variables keep their default value.
    pub fn from_env() -> Self {
        if dotenv::dotenv().is_ok() {
            debug!("Loaded environment variables from .env file");
        }

        let mut config = Self::default();
        if let Some(url) = env_var("UPDATER_CDN_URL") {
            config.cdn_url = url;
        }
        if let Some(dir) = env_var("UPDATER_AUTH_DIR") {
            config.auth_dir = Some(PathBuf::from(dir));
        }
        if let Some(workers) = env_parse("UPDATER_CONTENT_WORKERS") {
            config.content_workers = workers;
        }
        if let Some(workers) = env_parse("UPDATER_BATCH_WORKERS") {
            config.batch_workers = workers;
        }
        if let Some(attempts) = env_parse("UPDATER_MAX_LOGON_ATTEMPTS") {
            config.max_logon_attempts = attempts;
        }
        if let Some(ms) = env_parse::<u64>("UPDATER_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(flag) = env_parse("UPDATER_NORMALIZED_BATCH_PROGRESS") {
            config.normalized_batch_progress = flag;
        }
        config
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            server_app_id: SERVER_APP_ID,
            workshop_app_id: WORKSHOP_APP_ID,
            poll_interval: Duration::from_millis(500),
            max_logon_attempts: 5,
            content_workers: 8,
            batch_workers: 1,
            normalized_batch_progress: false,
            auth_dir: None,
            cdn_url: "http://127.0.0.1:8080/".to_string(),
            request_timeout: Duration::from_secs(30),
            user_agent: "updater/0.1.0".to_string(),
            request_retries: 3,
            retry_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

fn invalid(message: &str, field: &str) -> UpdaterError {
    UpdaterError::Configuration {
        message: message.to_string(),
        field: Some(field.to_string()),
        suggestion: Some(format!("Set {} to a positive value", field)),
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.trim().parse().ok())
}

/// Builder for [`UpdaterConfig`]
#[derive(Debug, Clone, Default)]
pub struct UpdaterConfigBuilder {
    config: UpdaterConfig,
}

impl UpdaterConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn max_logon_attempts(mut self, attempts: u32) -> Self {
        self.config.max_logon_attempts = attempts;
        self
    }

    pub fn content_workers(mut self, workers: usize) -> Self {
        self.config.content_workers = workers;
        self
    }

    pub fn batch_workers(mut self, workers: usize) -> Self {
        self.config.batch_workers = workers;
        self
    }

    pub fn normalized_batch_progress(mut self, enabled: bool) -> Self {
        self.config.normalized_batch_progress = enabled;
        self
    }

    pub fn auth_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.auth_dir = Some(dir.into());
        self
    }

    pub fn cdn_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.cdn_url = url.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn request_retries(mut self, retries: usize) -> Self {
        self.config.request_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn build(self) -> UpdaterConfig {
        self.config
    }
}

/// Credentials read from `UPDATER_USERNAME`, `UPDATER_PASSWORD` and `UPDATER_API_KEY`
///
/// Read on every call so a credential change is picked up by the next connect.
/// An unset username means anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn credentials(&self) -> Credentials {
        match env_var("UPDATER_USERNAME") {
            Some(username) => Credentials::Credentialed {
                username,
                secret: std::env::var("UPDATER_PASSWORD").unwrap_or_default(),
                api_key: env_var("UPDATER_API_KEY"),
            },
            None => Credentials::Anonymous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UpdaterConfig::default();
        assert_eq!(config.server_app_id, 233780);
        assert_eq!(config.workshop_app_id, 107410);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.max_logon_attempts, 5);
        assert_eq!(config.batch_workers, 1);
        assert!(!config.normalized_batch_progress);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let config = UpdaterConfigBuilder::new()
            .batch_workers(4)
            .poll_interval(Duration::from_millis(20))
            .auth_dir("/tmp/auth")
            .normalized_batch_progress(true)
            .build();

        assert_eq!(config.batch_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.auth_dir, Some(PathBuf::from("/tmp/auth")));
        assert!(config.normalized_batch_progress);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = UpdaterConfigBuilder::new().batch_workers(0).build();
        let err = config.validate().unwrap_err();
        assert_eq!(err.category(), "configuration");
        assert!(err.to_string().contains("batch worker"));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let config = UpdaterConfig::default();
        assert_eq!(config.get_retry_delay(0), Duration::from_secs(1));
        assert_eq!(config.get_retry_delay(2), Duration::from_secs(4));
        assert_eq!(config.get_retry_delay(10), Duration::from_secs(60));
    }
}
