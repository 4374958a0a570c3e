//! Runtime configuration from the environment

use crate::db::DEFAULT_LOCK_TTL_SECS;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_CLASSIFIER_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CAPABILITY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_HISTORY_LIMIT: usize = 10;
const DEFAULT_WEBHOOK_PER_MINUTE: u32 = 1_000;
const DEFAULT_CHAT_PER_MINUTE: u32 = 50;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub port: u16,
    pub routing: RoutingConfig,
    pub rate_limits: RateLimits,
}

/// Knobs the router reads on every turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingConfig {
    pub lock_ttl_secs: i64,
    pub classifier_timeout: Duration,
    pub capability_timeout: Duration,
    pub history_limit: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            classifier_timeout: Duration::from_millis(DEFAULT_CLASSIFIER_TIMEOUT_MS),
            capability_timeout: Duration::from_millis(DEFAULT_CAPABILITY_TIMEOUT_MS),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Requests per minute allowed from one client address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub webhook_per_minute: u32,
    pub chat_per_minute: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            webhook_per_minute: DEFAULT_WEBHOOK_PER_MINUTE,
            chat_per_minute: DEFAULT_CHAT_PER_MINUTE,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let db_path = lookup("INTAKE_DB_PATH").map_or_else(default_db_path, PathBuf::from);

        let positive = |v: &u64| *v > 0;
        let routing = RoutingConfig {
            lock_ttl_secs: parse_or(&lookup, "INTAKE_LOCK_TTL_SECS", DEFAULT_LOCK_TTL_SECS, |v| {
                *v > 0
            }),
            classifier_timeout: Duration::from_millis(parse_or(
                &lookup,
                "INTAKE_CLASSIFIER_TIMEOUT_MS",
                DEFAULT_CLASSIFIER_TIMEOUT_MS,
                positive,
            )),
            capability_timeout: Duration::from_millis(parse_or(
                &lookup,
                "INTAKE_CAPABILITY_TIMEOUT_MS",
                DEFAULT_CAPABILITY_TIMEOUT_MS,
                positive,
            )),
            history_limit: parse_or(&lookup, "INTAKE_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT, |_| true),
        };

        let per_minute = |v: &u32| *v > 0;
        let rate_limits = RateLimits {
            webhook_per_minute: parse_or(
                &lookup,
                "INTAKE_WEBHOOK_RATE_PER_MIN",
                DEFAULT_WEBHOOK_PER_MINUTE,
                per_minute,
            ),
            chat_per_minute: parse_or(
                &lookup,
                "INTAKE_CHAT_RATE_PER_MIN",
                DEFAULT_CHAT_PER_MINUTE,
                per_minute,
            ),
        };

        Self {
            db_path,
            port: parse_or(&lookup, "INTAKE_PORT", DEFAULT_PORT, |_| true),
            routing,
            rate_limits,
        }
    }
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".intake-desk").join("intake.db")
}

/// Parse `key`, falling back to `default` (with a warning) when the value
/// does not parse or fails `valid`.
fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    valid: impl Fn(&T) -> bool,
) -> T
where
    T: FromStr + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            tracing::warn!(key, value = %raw, %default, "Invalid config value, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.port, 8000);
        assert_eq!(config.routing, RoutingConfig::default());
        assert_eq!(config.routing.lock_ttl_secs, 86_400);
        assert_eq!(config.routing.history_limit, 10);
        assert!(config.db_path.ends_with(".intake-desk/intake.db"));
        assert_eq!(config.rate_limits.webhook_per_minute, 1_000);
        assert_eq!(config.rate_limits.chat_per_minute, 50);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("INTAKE_DB_PATH", "/tmp/desk.db"),
            ("INTAKE_PORT", "9001"),
            ("INTAKE_LOCK_TTL_SECS", "600"),
            ("INTAKE_CLASSIFIER_TIMEOUT_MS", "250"),
            ("INTAKE_HISTORY_LIMIT", "4"),
            ("INTAKE_CHAT_RATE_PER_MIN", "20"),
        ]);
        assert_eq!(config.db_path, PathBuf::from("/tmp/desk.db"));
        assert_eq!(config.port, 9001);
        assert_eq!(config.routing.lock_ttl_secs, 600);
        assert_eq!(config.routing.classifier_timeout, Duration::from_millis(250));
        assert_eq!(config.routing.history_limit, 4);
        assert_eq!(config.rate_limits.chat_per_minute, 20);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("INTAKE_PORT", "eighty"),
            ("INTAKE_LOCK_TTL_SECS", "-5"),
            ("INTAKE_CAPABILITY_TIMEOUT_MS", "0"),
            ("INTAKE_WEBHOOK_RATE_PER_MIN", "0"),
        ]);
        assert_eq!(config.port, 8000);
        assert_eq!(config.routing.lock_ttl_secs, 86_400);
        assert_eq!(config.routing.capability_timeout, Duration::from_secs(30));
        assert_eq!(config.rate_limits.webhook_per_minute, 1_000);
    }
}
