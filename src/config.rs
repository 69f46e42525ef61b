//! Workflow configuration.
//!
//! Defaults match the production portal; every value can be overridden from
//! `PORTAL_*` environment variables (a `.env` file is honoured).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

pub const DEFAULT_DB_PATH: &str = "portal.db";
pub const DEFAULT_CM_SESSION_TIMEOUT_MINUTES: u64 = 15;
pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub db_path: PathBuf,
    /// Sliding lifetime of a delegated collection-manager session.
    pub cm_session_timeout: Duration,
    /// Budget for a single store transaction.
    pub transaction_timeout: Duration,
    /// How often expired CM sessions are swept.
    pub cleanup_interval: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            cm_session_timeout: Duration::from_secs(DEFAULT_CM_SESSION_TIMEOUT_MINUTES * 60),
            transaction_timeout: Duration::from_secs(DEFAULT_TRANSACTION_TIMEOUT_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
        }
    }
}

impl WorkflowConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Ok(path) = std::env::var("PORTAL_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(minutes) = env_u64("PORTAL_CM_SESSION_TIMEOUT_MINUTES")? {
            config.cm_session_timeout = Duration::from_secs(minutes * 60);
        }
        if let Some(secs) = env_u64("PORTAL_TRANSACTION_TIMEOUT_SECS")? {
            config.transaction_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("PORTAL_CLEANUP_INTERVAL_SECS")? {
            config.cleanup_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cm_session_timeout.is_zero() {
            anyhow::bail!("CM session timeout must be greater than zero");
        }
        if self.transaction_timeout.is_zero() {
            anyhow::bail!("transaction timeout must be greater than zero");
        }
        if self.cleanup_interval.is_zero() {
            anyhow::bail!("CM session cleanup interval must be greater than zero");
        }
        Ok(())
    }

    pub fn cm_session_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.cm_session_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(DEFAULT_CM_SESSION_TIMEOUT_MINUTES as i64))
    }

    pub fn cleanup_every(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.cleanup_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_CLEANUP_INTERVAL_SECS as i64))
    }
}

fn env_u64(key: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("{key} must be a whole number, got {raw:?}")),
        Err(_) => Ok(None),
    }
}
