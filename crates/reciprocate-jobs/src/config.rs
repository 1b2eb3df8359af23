//! Environment configuration for the job binaries.

use std::time::Duration;

use reciprocate_core::{Pacing, RunConfig};
use thiserror::Error;

pub const DATABASE_URL: &str = "RECIPROCATE_DATABASE_URL";
pub const LOOKUP_URL: &str = "RECIPROCATE_LOOKUP_URL";
pub const WEBHOOK_URL: &str = "DISCORD_WEBHOOK_URL";
pub const MAX_RETRY_COUNT: &str = "RECIPROCATE_MAX_RETRY_COUNT";
pub const DRAIN_BATCH_SIZE: &str = "RECIPROCATE_DRAIN_BATCH_SIZE";
pub const LOOKUP_TIMEOUT_SECS: &str = "RECIPROCATE_LOOKUP_TIMEOUT_SECS";
pub const PACING: &str = "RECIPROCATE_PACING";

const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{key}='{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything a job binary needs, read once at startup.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub database_url: String,
    pub lookup_url: String,
    pub webhook_url: Option<String>,
    pub lookup_timeout: Duration,
    pub run: RunConfig,
}

impl JobsConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let mut run = RunConfig::default();
        if let Some(value) = get(MAX_RETRY_COUNT) {
            run.max_retry_count = parse_positive(MAX_RETRY_COUNT, &value)?;
        }
        if let Some(value) = get(DRAIN_BATCH_SIZE) {
            run.drain_batch_size = parse_positive(DRAIN_BATCH_SIZE, &value)?;
        }
        if let Some(value) = get(PACING) {
            run.pacing = parse_pacing(&value)?;
        }

        let lookup_timeout = match get(LOOKUP_TIMEOUT_SECS) {
            Some(value) => Duration::from_secs(parse_positive(LOOKUP_TIMEOUT_SECS, &value)?),
            None => Duration::from_secs(DEFAULT_LOOKUP_TIMEOUT_SECS),
        };

        Ok(Self {
            database_url: required(DATABASE_URL)?,
            lookup_url: required(LOOKUP_URL)?.trim_end_matches('/').to_string(),
            webhook_url: get(WEBHOOK_URL),
            lookup_timeout,
            run,
        })
    }
}

fn parse_positive<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let invalid = |reason: String| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason,
    };
    let parsed: T = value.parse().map_err(|e: T::Err| invalid(e.to_string()))?;
    if parsed <= T::default() {
        return Err(invalid("must be positive".to_string()));
    }
    Ok(parsed)
}

fn parse_pacing(value: &str) -> Result<Pacing, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "off" | "none" | "false" | "0" => Ok(Pacing::none()),
        "on" | "default" | "true" | "1" => Ok(Pacing::default()),
        _ => Err(ConfigError::Invalid {
            key: PACING,
            value: value.to_string(),
            reason: "expected 'on' or 'off'".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<JobsConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        JobsConfig::from_lookup(|key| env.get(key).cloned())
    }

    const BASE: &[(&str, &str)] = &[
        (DATABASE_URL, "postgres://localhost/reciprocate"),
        (LOOKUP_URL, "http://lookup.internal:8080/"),
    ];

    #[test]
    fn defaults_apply_when_only_required_keys_are_set() {
        let config = load(BASE).unwrap();
        assert_eq!(config.lookup_url, "http://lookup.internal:8080");
        assert_eq!(config.webhook_url, None);
        assert_eq!(config.lookup_timeout, Duration::from_secs(30));
        assert_eq!(config.run, RunConfig::default());
    }

    #[test]
    fn missing_database_url_is_reported_by_name() {
        let err = load(&[(LOOKUP_URL, "http://x")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing(DATABASE_URL));
        assert_eq!(err.to_string(), "RECIPROCATE_DATABASE_URL is not set");
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = BASE.to_vec();
        pairs.extend([
            (MAX_RETRY_COUNT, "3"),
            (DRAIN_BATCH_SIZE, "10"),
            (LOOKUP_TIMEOUT_SECS, "5"),
            (PACING, "off"),
            (WEBHOOK_URL, "https://discord.com/api/webhooks/1/abc"),
        ]);
        let config = load(&pairs).unwrap();
        assert_eq!(config.run.max_retry_count, 3);
        assert_eq!(config.run.drain_batch_size, 10);
        assert_eq!(config.run.pacing, Pacing::none());
        assert_eq!(config.lookup_timeout, Duration::from_secs(5));
        assert!(config.webhook_url.is_some());
    }

    #[test]
    fn non_positive_numbers_are_rejected() {
        let mut pairs = BASE.to_vec();
        pairs.push((MAX_RETRY_COUNT, "0"));
        assert!(matches!(
            load(&pairs),
            Err(ConfigError::Invalid { key: MAX_RETRY_COUNT, .. })
        ));

        let mut pairs = BASE.to_vec();
        pairs.push((DRAIN_BATCH_SIZE, "lots"));
        assert!(matches!(
            load(&pairs),
            Err(ConfigError::Invalid { key: DRAIN_BATCH_SIZE, .. })
        ));
    }

    #[test]
    fn blank_webhook_counts_as_unset() {
        let mut pairs = BASE.to_vec();
        pairs.push((WEBHOOK_URL, "   "));
        assert_eq!(load(&pairs).unwrap().webhook_url, None);
    }
}
