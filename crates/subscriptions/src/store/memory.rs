//! In-memory store
//!
//! A single async mutex guards all tables, which makes every trait method
//! trivially atomic. Suitable for tests and for hosts that embed the engine
//! without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ConflictCheck, PlanStore, SubscriptionStore, UsageStore};
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::owner::OwnerRef;
use crate::plan::{Plan, PlanListing};
use crate::subscription::{NewSubscription, Subscription};
use crate::time_window::TimeWindow;
use crate::usage::{IncrementOutcome, Usage, UsageKey};

#[derive(Debug, Default)]
struct Tables {
    plans: HashMap<Uuid, Plan>,
    subscriptions: HashMap<Uuid, Subscription>,
    usages: HashMap<UsageKey, Usage>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a usage row as-is, bypassing limit checks (imports, repairs)
    pub async fn put_usage(&self, usage: Usage) {
        let mut tables = self.tables.lock().await;
        tables.usages.insert(usage.key(), usage);
    }

    /// Write a subscription row as-is, bypassing conflict checks (imports, repairs)
    pub async fn put_subscription(&self, subscription: Subscription) {
        let mut tables = self.tables.lock().await;
        tables.subscriptions.insert(subscription.id, subscription);
    }
}

fn sorted_by_start(mut subscriptions: Vec<Subscription>) -> Vec<Subscription> {
    subscriptions.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then(a.created_at.cmp(&b.created_at)));
    subscriptions
}

#[async_trait]
impl PlanStore for InMemoryStore {
    async fn find_plan(&self, id: Uuid) -> SubscriptionResult<Option<Plan>> {
        let tables = self.tables.lock().await;
        Ok(tables.plans.get(&id).cloned())
    }

    async fn list_plans(&self, listing: PlanListing) -> SubscriptionResult<Vec<Plan>> {
        let tables = self.tables.lock().await;
        let mut plans: Vec<Plan> = tables
            .plans
            .values()
            .filter(|p| listing.includes(p.state))
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.position);
        Ok(plans)
    }

    async fn save_plan(&self, plan: &Plan) -> SubscriptionResult<()> {
        let mut plan = plan.clone();
        plan.features.sort_by_key(|f| f.position);
        let mut tables = self.tables.lock().await;
        tables.plans.insert(plan.id, plan);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn insert_subscription(
        &self,
        new: NewSubscription,
        now: OffsetDateTime,
        check: ConflictCheck<'_>,
    ) -> SubscriptionResult<Subscription> {
        let mut tables = self.tables.lock().await;
        let existing = sorted_by_start(
            tables
                .subscriptions
                .values()
                .filter(|s| s.owner == new.owner)
                .cloned()
                .collect(),
        );
        check(&existing)?;

        let subscription = new.into_subscription(now);
        tables.subscriptions.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn replace_subscription(
        &self,
        previous: &Subscription,
        new: NewSubscription,
        now: OffsetDateTime,
        check: ConflictCheck<'_>,
    ) -> SubscriptionResult<Subscription> {
        if previous.owner != new.owner {
            return Err(SubscriptionError::InvalidArgument(format!(
                "cannot replace a subscription of {} with one for {}",
                previous.owner, new.owner
            )));
        }

        let mut tables = self.tables.lock().await;
        if !tables.subscriptions.contains_key(&previous.id) {
            return Err(SubscriptionError::SubscriptionNotFound(previous.id));
        }
        let existing = sorted_by_start(
            tables
                .subscriptions
                .values()
                .filter(|s| s.owner == new.owner)
                .map(|s| if s.id == previous.id { previous.clone() } else { s.clone() })
                .collect(),
        );
        check(&existing)?;

        let subscription = new.into_subscription(now);
        tables.subscriptions.insert(previous.id, previous.clone());
        tables.subscriptions.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn find_subscription(&self, id: Uuid) -> SubscriptionResult<Option<Subscription>> {
        let tables = self.tables.lock().await;
        Ok(tables.subscriptions.get(&id).cloned())
    }

    async fn subscriptions_of(&self, owner: &OwnerRef) -> SubscriptionResult<Vec<Subscription>> {
        let tables = self.tables.lock().await;
        Ok(sorted_by_start(
            tables
                .subscriptions
                .values()
                .filter(|s| &s.owner == owner)
                .cloned()
                .collect(),
        ))
    }

    async fn update_subscription(&self, subscription: &Subscription) -> SubscriptionResult<()> {
        let mut tables = self.tables.lock().await;
        match tables.subscriptions.get_mut(&subscription.id) {
            Some(stored) => {
                *stored = subscription.clone();
                Ok(())
            }
            None => Err(SubscriptionError::SubscriptionNotFound(subscription.id)),
        }
    }

    async fn expiring_recurring(&self, window: TimeWindow) -> SubscriptionResult<Vec<Subscription>> {
        let tables = self.tables.lock().await;
        Ok(sorted_by_start(
            tables
                .subscriptions
                .values()
                .filter(|s| s.is_recurring && window.contains(s.expires_at))
                .cloned()
                .collect(),
        ))
    }

    async fn list_subscriptions(&self) -> SubscriptionResult<Vec<Subscription>> {
        let tables = self.tables.lock().await;
        Ok(sorted_by_start(tables.subscriptions.values().cloned().collect()))
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn find_usage(&self, key: &UsageKey) -> SubscriptionResult<Option<Usage>> {
        let tables = self.tables.lock().await;
        Ok(tables.usages.get(key).cloned())
    }

    async fn usages_of(&self, subscription_id: Uuid) -> SubscriptionResult<Vec<Usage>> {
        let tables = self.tables.lock().await;
        let mut usages: Vec<Usage> = tables
            .usages
            .values()
            .filter(|u| u.subscription_id == subscription_id)
            .cloned()
            .collect();
        usages.sort_by(|a, b| a.code.cmp(&b.code).then(a.scope.cmp(&b.scope)));
        Ok(usages)
    }

    async fn ensure_usage(&self, key: &UsageKey) -> SubscriptionResult<Usage> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .usages
            .entry(key.clone())
            .or_insert_with(|| Usage::empty(key))
            .clone())
    }

    async fn try_increment(
        &self,
        key: &UsageKey,
        amount: i64,
        ceiling: Option<i64>,
    ) -> SubscriptionResult<IncrementOutcome> {
        let mut tables = self.tables.lock().await;
        let usage = tables
            .usages
            .entry(key.clone())
            .or_insert_with(|| Usage::empty(key));

        let next = usage.used.saturating_add(amount);
        if ceiling.is_some_and(|limit| next > limit) {
            return Ok(IncrementOutcome::Rejected { used: usage.used });
        }
        usage.used = next;
        Ok(IncrementOutcome::Applied { used: next })
    }

    async fn decrement_clamped(&self, key: &UsageKey, amount: i64) -> SubscriptionResult<Usage> {
        let mut tables = self.tables.lock().await;
        let usage = tables
            .usages
            .entry(key.clone())
            .or_insert_with(|| Usage::empty(key));
        usage.used = usage.used.saturating_sub(amount).max(0);
        Ok(usage.clone())
    }

    async fn reset_usage(&self, key: &UsageKey) -> SubscriptionResult<Usage> {
        let mut tables = self.tables.lock().await;
        let usage = tables
            .usages
            .entry(key.clone())
            .or_insert_with(|| Usage::empty(key));
        usage.used = 0;
        Ok(usage.clone())
    }

    async fn list_usages(&self) -> SubscriptionResult<Vec<Usage>> {
        let tables = self.tables.lock().await;
        Ok(tables.usages.values().cloned().collect())
    }
}
