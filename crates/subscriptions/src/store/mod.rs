//! Persistence seam
//!
//! The engine never talks to a database directly. Hosts plug in any type that
//! implements these traits; two reference implementations ship with the crate.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SubscriptionResult;
use crate::owner::OwnerRef;
use crate::plan::{Plan, PlanListing};
use crate::subscription::{NewSubscription, Subscription};
use crate::time_window::TimeWindow;
use crate::usage::{IncrementOutcome, Usage, UsageKey};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Conflict check run against the owner's existing subscriptions before an insert
pub type ConflictCheck<'a> = &'a (dyn Fn(&[Subscription]) -> SubscriptionResult<()> + Send + Sync);

#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Find a plan with its features ordered by position
    async fn find_plan(&self, id: Uuid) -> SubscriptionResult<Option<Plan>>;

    /// Plans matching a listing, ordered by position
    async fn list_plans(&self, listing: PlanListing) -> SubscriptionResult<Vec<Plan>>;

    /// Insert or replace a plan and its features
    async fn save_plan(&self, plan: &Plan) -> SubscriptionResult<()>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Run `check` against the owner's subscriptions and insert when it passes.
    ///
    /// Check and insert are atomic per owner: two concurrent inserts for the
    /// same owner never both observe the state before the other's row.
    async fn insert_subscription(
        &self,
        new: NewSubscription,
        now: OffsetDateTime,
        check: ConflictCheck<'_>,
    ) -> SubscriptionResult<Subscription>;

    /// Persist the mutated `previous` row and insert `new` as one unit.
    ///
    /// `check` sees the owner's subscriptions with `previous` already applied.
    /// When the check or any write fails, nothing is persisted.
    async fn replace_subscription(
        &self,
        previous: &Subscription,
        new: NewSubscription,
        now: OffsetDateTime,
        check: ConflictCheck<'_>,
    ) -> SubscriptionResult<Subscription>;

    async fn find_subscription(&self, id: Uuid) -> SubscriptionResult<Option<Subscription>>;

    /// All subscriptions of an owner, ordered by `starts_at`
    async fn subscriptions_of(&self, owner: &OwnerRef) -> SubscriptionResult<Vec<Subscription>>;

    /// Persist a mutated subscription. Fails with `SubscriptionNotFound` for unknown ids.
    async fn update_subscription(&self, subscription: &Subscription) -> SubscriptionResult<()>;

    /// Recurring subscriptions whose expiry falls inside `window`
    async fn expiring_recurring(&self, window: TimeWindow) -> SubscriptionResult<Vec<Subscription>>;

    async fn list_subscriptions(&self) -> SubscriptionResult<Vec<Subscription>>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn find_usage(&self, key: &UsageKey) -> SubscriptionResult<Option<Usage>>;

    async fn usages_of(&self, subscription_id: Uuid) -> SubscriptionResult<Vec<Usage>>;

    /// Existing row, or a new row with `used = 0`
    async fn ensure_usage(&self, key: &UsageKey) -> SubscriptionResult<Usage>;

    /// Add `amount` unless the result would exceed `ceiling`. Check and write are one step.
    async fn try_increment(
        &self,
        key: &UsageKey,
        amount: i64,
        ceiling: Option<i64>,
    ) -> SubscriptionResult<IncrementOutcome>;

    /// Subtract `amount`, clamping at zero
    async fn decrement_clamped(&self, key: &UsageKey, amount: i64) -> SubscriptionResult<Usage>;

    async fn reset_usage(&self, key: &UsageKey) -> SubscriptionResult<Usage>;

    async fn list_usages(&self) -> SubscriptionResult<Vec<Usage>>;
}

/// Everything the engine needs from a backing store
pub trait EntitlementStore: PlanStore + SubscriptionStore + UsageStore {}

impl<T> EntitlementStore for T where T: PlanStore + SubscriptionStore + UsageStore {}
