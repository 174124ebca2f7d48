use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

/// Dispatcher tuning, loaded from `EVENT_RELIABILITY_*` variables.
/// Retry policies are not part of it; they are chosen per handler.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Upper bound on handler invocations running at once
    pub max_concurrent_handlers: usize,
    pub validate_sequences: bool,
    /// Idle retry contexts and sequence records older than this are purged
    pub retention: Duration,
    pub cleanup_interval: Duration,
    pub max_retained_records: usize,
    pub dead_letter_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 64,
            validate_sequences: true,
            retention: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            max_retained_records: 10_000,
            dead_letter_capacity: 10_000,
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their default
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            max_concurrent_handlers: parse_or(
                &lookup,
                "EVENT_RELIABILITY_MAX_CONCURRENT_HANDLERS",
                defaults.max_concurrent_handlers,
            )?,
            validate_sequences: parse_or(
                &lookup,
                "EVENT_RELIABILITY_VALIDATE_SEQUENCES",
                defaults.validate_sequences,
            )?,
            retention: Duration::from_secs(parse_or(
                &lookup,
                "EVENT_RELIABILITY_RETENTION_SECS",
                defaults.retention.as_secs(),
            )?),
            cleanup_interval: Duration::from_secs(parse_or(
                &lookup,
                "EVENT_RELIABILITY_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval.as_secs(),
            )?),
            max_retained_records: parse_or(
                &lookup,
                "EVENT_RELIABILITY_MAX_RETAINED_RECORDS",
                defaults.max_retained_records,
            )?,
            dead_letter_capacity: parse_or(
                &lookup,
                "EVENT_RELIABILITY_DEAD_LETTER_CAPACITY",
                defaults.dead_letter_capacity,
            )?,
        };

        if config.max_concurrent_handlers == 0 {
            anyhow::bail!("EVENT_RELIABILITY_MAX_CONCURRENT_HANDLERS must be at least 1");
        }
        if config.cleanup_interval.is_zero() {
            anyhow::bail!("EVENT_RELIABILITY_CLEANUP_INTERVAL_SECS must be at least 1");
        }

        Ok(config)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}
