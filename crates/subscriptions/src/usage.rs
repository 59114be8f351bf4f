//! Usage counters for limit features

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::feature::Remaining;

/// Consumer a usage row is scoped to, when a limit is metered per consumer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsageScope {
    pub consumer_type: String,
    pub consumer_id: String,
}

impl UsageScope {
    pub fn new(consumer_type: impl Into<String>, consumer_id: impl Into<String>) -> Self {
        Self {
            consumer_type: consumer_type.into(),
            consumer_id: consumer_id.into(),
        }
    }
}

impl fmt::Display for UsageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.consumer_type, self.consumer_id)
    }
}

/// Identity of a usage row: one per (subscription, code, scope)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub subscription_id: Uuid,
    pub code: String,
    pub scope: Option<UsageScope>,
}

impl UsageKey {
    pub fn new(subscription_id: Uuid, code: impl Into<String>, scope: Option<UsageScope>) -> Self {
        Self {
            subscription_id,
            code: code.into(),
            scope,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub code: String,
    pub scope: Option<UsageScope>,
    /// Never negative
    pub used: i64,
}

impl Usage {
    /// Fresh zero row for a key
    pub fn empty(key: &UsageKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id: key.subscription_id,
            code: key.code.clone(),
            scope: key.scope.clone(),
            used: 0,
        }
    }

    pub fn key(&self) -> UsageKey {
        UsageKey::new(self.subscription_id, self.code.clone(), self.scope.clone())
    }
}

/// Result of a guarded increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// Counter was increased; carries the new value
    Applied { used: i64 },
    /// Ceiling would have been exceeded; carries the unchanged value
    Rejected { used: i64 },
}

/// Usage of one consumer within a scoped limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopedUsage {
    pub scope: UsageScope,
    pub used: i64,
    pub remaining: Remaining,
}

/// Per-feature usage summary for a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureUsageStat {
    pub code: String,
    /// 0 means unlimited
    pub limit: u64,
    /// Sum over the unscoped row and every scoped row
    pub used: i64,
    pub remaining: Remaining,
    pub scopes: Vec<ScopedUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_usage_matches_key() {
        let key = UsageKey::new(Uuid::new_v4(), "posts", Some(UsageScope::new("project", "42")));
        let usage = Usage::empty(&key);
        assert_eq!(usage.used, 0);
        assert_eq!(usage.key(), key);
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(UsageScope::new("project", "42").to_string(), "project:42");
    }
}
