//! Worker configuration from the environment

use std::str::FromStr;

use entitle_subscriptions::SubscriptionsConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has an invalid value '{value}'")]
    Invalid { key: &'static str, value: String },

    #[error(transparent)]
    Subscriptions(#[from] entitle_subscriptions::SubscriptionError),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Six-field cron expression (seconds first)
    pub renewal_cron: String,
    pub invariant_cron: String,
    pub renewal_mark_as_paid: bool,
    pub run_migrations: bool,
    pub subscriptions: SubscriptionsConfig,
}

/// Daily at 00:05 UTC
pub const DEFAULT_RENEWAL_CRON: &str = "0 5 0 * * *";
/// Daily at 03:00 UTC
pub const DEFAULT_INVARIANT_CRON: &str = "0 0 3 * * *";

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        _ => Ok(default),
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let max_connections = parsed(&lookup, "DB_MAX_CONNECTIONS", 5u32)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "DB_MAX_CONNECTIONS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            database_url,
            max_connections,
            renewal_cron: lookup("RENEWAL_CRON").unwrap_or_else(|| DEFAULT_RENEWAL_CRON.to_string()),
            invariant_cron: lookup("INVARIANT_CRON").unwrap_or_else(|| DEFAULT_INVARIANT_CRON.to_string()),
            renewal_mark_as_paid: parsed(&lookup, "RENEWAL_MARK_AS_PAID", false)?,
            run_migrations: parsed(&lookup, "RUN_MIGRATIONS", true)?,
            subscriptions: SubscriptionsConfig::from_lookup(&lookup)?,
        })
    }
}
