//! Owner capability traits
//!
//! Any host entity can hold subscriptions by exposing a stable `(type, id)` reference.
//! Owners that want plan limits enforced on their own relations also report how many
//! related items they currently hold.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SubscriptionResult;
use crate::feature::Remaining;

/// Polymorphic owner reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerRef {
    pub owner_type: String,
    pub owner_id: String,
}

impl OwnerRef {
    pub fn new(owner_type: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            owner_type: owner_type.into(),
            owner_id: owner_id.into(),
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_type, self.owner_id)
    }
}

pub trait SubscribableOwner: Send + Sync {
    fn owner_ref(&self) -> OwnerRef;
}

impl SubscribableOwner for OwnerRef {
    fn owner_ref(&self) -> OwnerRef {
        self.clone()
    }
}

impl<T: SubscribableOwner + ?Sized> SubscribableOwner for &T {
    fn owner_ref(&self) -> OwnerRef {
        (**self).owner_ref()
    }
}

#[async_trait]
pub trait RelationsLimitable: SubscribableOwner {
    /// Current size of a named relation, `None` if the owner has no such relation
    async fn relation_count(&self, relation: &str) -> SubscriptionResult<Option<u64>>;
}

/// Size of a restricted relation against its plan limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelationUsage {
    pub used: u64,
    pub available: Remaining,
    pub remaining: Remaining,
}

impl RelationUsage {
    pub fn new(used: u64, available: Remaining) -> Self {
        let remaining = match available {
            Remaining::Unlimited => Remaining::Unlimited,
            Remaining::Limited(limit) => {
                Remaining::Limited(limit - i64::try_from(used).unwrap_or(i64::MAX))
            }
        };
        Self {
            used,
            available,
            remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_ref_display() {
        assert_eq!(OwnerRef::new("team", "7").to_string(), "team:7");
    }

    #[test]
    fn test_relation_usage_remaining() {
        let usage = RelationUsage::new(4, Remaining::Limited(3));
        assert_eq!(usage.remaining, Remaining::Limited(-1));

        let unlimited = RelationUsage::new(400, Remaining::Unlimited);
        assert_eq!(unlimited.remaining, Remaining::Unlimited);
    }
}
