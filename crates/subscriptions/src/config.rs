//! Engine configuration

use crate::error::{SubscriptionError, SubscriptionResult};

pub const PAYMENT_TOLERANCE_DAYS_ENV: &str = "SUBSCRIPTIONS_PAYMENT_TOLERANCE_DAYS";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionsConfig {
    /// Days after creation during which an unpaid subscription still counts as active
    pub payment_tolerance_days: u32,
}

impl SubscriptionsConfig {
    pub fn new(payment_tolerance_days: u32) -> Self {
        Self {
            payment_tolerance_days,
        }
    }

    /// Load from the process environment, honouring a `.env` file if present
    pub fn from_env() -> SubscriptionResult<Self> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> SubscriptionResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let payment_tolerance_days = match lookup(PAYMENT_TOLERANCE_DAYS_ENV) {
            Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<u32>().map_err(|e| {
                SubscriptionError::Config(format!(
                    "{} must be a non-negative integer, got '{}': {}",
                    PAYMENT_TOLERANCE_DAYS_ENV, raw, e
                ))
            })?,
            _ => 0,
        };

        Ok(Self {
            payment_tolerance_days,
        })
    }
}
