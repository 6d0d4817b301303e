//! Process configuration from `RECONCILER_*` environment variables.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::engine::EngineSettings;
use crate::impact::PolicyTable;
use crate::storage::RetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// YAML policy overriding the built-in defaults.
    pub policy_file: Option<PathBuf>,
    pub quote_ttl_hours: i64,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub shutdown_grace_secs: u64,
    pub expiry_sweep_secs: u64,
    pub event_buffer: usize,
    /// JSON array of package snapshots seeding the catalog search.
    pub catalog_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy_file: None,
            quote_ttl_hours: 168,
            retry_max_attempts: 3,
            retry_base_ms: 200,
            retry_max_ms: 5000,
            shutdown_grace_secs: 10,
            expiry_sweep_secs: 60,
            event_buffer: 256,
            catalog_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their
    /// defaults; set but unparseable ones are an error.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            policy_file: path_var(&lookup, "RECONCILER_POLICY_FILE"),
            quote_ttl_hours: parsed(&lookup, "RECONCILER_QUOTE_TTL_HOURS", defaults.quote_ttl_hours)?,
            retry_max_attempts: parsed(
                &lookup,
                "RECONCILER_RETRY_MAX_ATTEMPTS",
                defaults.retry_max_attempts,
            )?,
            retry_base_ms: parsed(&lookup, "RECONCILER_RETRY_BASE_MS", defaults.retry_base_ms)?,
            retry_max_ms: parsed(&lookup, "RECONCILER_RETRY_MAX_MS", defaults.retry_max_ms)?,
            shutdown_grace_secs: parsed(
                &lookup,
                "RECONCILER_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace_secs,
            )?,
            expiry_sweep_secs: parsed(
                &lookup,
                "RECONCILER_EXPIRY_SWEEP_SECS",
                defaults.expiry_sweep_secs,
            )?,
            event_buffer: parsed(&lookup, "RECONCILER_EVENT_BUFFER", defaults.event_buffer)?,
            catalog_file: path_var(&lookup, "RECONCILER_CATALOG_FILE"),
        };

        if config.quote_ttl_hours <= 0 {
            bail!("RECONCILER_QUOTE_TTL_HOURS must be positive");
        }
        if config.retry_max_attempts == 0 {
            bail!("RECONCILER_RETRY_MAX_ATTEMPTS must be at least 1");
        }
        if config.event_buffer == 0 {
            bail!("RECONCILER_EVENT_BUFFER must be at least 1");
        }
        if config.expiry_sweep_secs == 0 {
            bail!("RECONCILER_EXPIRY_SWEEP_SECS must be at least 1");
        }
        Ok(config)
    }

    /// Policy from `policy_file`, or the defaults.
    pub fn policy(&self) -> anyhow::Result<PolicyTable> {
        match &self.policy_file {
            Some(path) => PolicyTable::load(path),
            None => Ok(PolicyTable::default()),
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms.max(self.retry_base_ms)),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn expiry_sweep(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_secs)
    }

    pub fn engine_settings(&self) -> anyhow::Result<EngineSettings> {
        Ok(EngineSettings {
            policy: self.policy()?,
            retry: self.retry(),
            quote_ttl: chrono::Duration::hours(self.quote_ttl_hours),
        })
    }
}

fn path_var<F>(lookup: &F, name: &str) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn parsed<F, T>(lookup: &F, name: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display + std::fmt::Debug + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
        _ => Ok(default),
    }
}
