//! Owner-facing subscription lifecycle
//!
//! Handles:
//! - Subscribing an owner to a plan, with trials and explicit start dates
//! - Migrating the active subscription to another plan
//! - Renewing expired and expiring subscriptions
//! - Cancelling and extending the active subscription
//! - Relation limits for owners that expose relation counts

use std::collections::BTreeMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::config::SubscriptionsConfig;
use crate::date_processor::{processor_for, EnvelopeRequest};
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::events::{Dispatch, EventDispatcher, SubscriptionEvent};
use crate::feature::Remaining;
use crate::owner::{OwnerRef, RelationUsage, RelationsLimitable, SubscribableOwner};
use crate::plan::{Plan, PlanType};
use crate::store::EntitlementStore;
use crate::subscription::{NewSubscription, Subscription, SubscriptionFilter};
use crate::time_window::{add_days, start_of_day, Clock, TimeWindow};

/// Cycle length used when neither the caller nor the plan gives one
pub const DEFAULT_DURATION_DAYS: u32 = 30;

/// Options for a new subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub is_recurring: bool,
    pub testing_days: u32,
    /// Only used by duration plans; falls back to the plan's own duration, then 30
    pub duration_days: Option<u32>,
    pub starts_at: Option<OffsetDateTime>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            is_recurring: true,
            testing_days: 0,
            duration_days: None,
            starts_at: None,
        }
    }
}

impl SubscribeOptions {
    pub fn recurring(mut self, is_recurring: bool) -> Self {
        self.is_recurring = is_recurring;
        self
    }

    pub fn with_testing_days(mut self, days: u32) -> Self {
        self.testing_days = days;
        self
    }

    pub fn with_duration_days(mut self, days: u32) -> Self {
        self.duration_days = Some(days);
        self
    }

    pub fn starting_at(mut self, starts_at: OffsetDateTime) -> Self {
        self.starts_at = Some(starts_at);
        self
    }
}

/// Options for moving the active subscription to another plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateOptions {
    pub is_recurring: bool,
    /// Switch now instead of at the end of the current cycle
    pub immediate: bool,
    pub duration_days: Option<u32>,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            is_recurring: true,
            immediate: false,
            duration_days: None,
        }
    }
}

impl MigrateOptions {
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            ..Self::default()
        }
    }
}

/// Internal parameters of a subscription insert
struct Insert {
    options: SubscribeOptions,
    dispatch: Dispatch,
    mark_as_paid: bool,
    renewal: bool,
}

fn resolve_duration(plan: &Plan, requested: Option<u32>) -> SubscriptionResult<u32> {
    let days = requested
        .or(plan.duration_days)
        .unwrap_or(DEFAULT_DURATION_DAYS);
    if plan.plan_type == PlanType::Duration && days < 1 {
        return Err(SubscriptionError::InvalidDuration(days));
    }
    Ok(days)
}

fn cycle_days(subscription: &Subscription) -> u32 {
    u32::try_from(subscription.duration_days()).unwrap_or(u32::MAX)
}

/// Reject a new window that would overlap the owner's active or upcoming coverage
pub fn check_conflicts(existing: &[Subscription], window: TimeWindow, now: OffsetDateTime) -> SubscriptionResult<()> {
    if existing
        .iter()
        .any(|s| s.is_active(now) && s.expires_at > window.starts_at)
    {
        return Err(SubscriptionError::ConflictingActiveSubscription);
    }
    if existing
        .iter()
        .any(|s| s.is_upcoming(now) && s.window().overlaps(&window))
    {
        return Err(SubscriptionError::ConflictingUpcomingSubscription);
    }
    Ok(())
}

pub struct SubscriptionManager<S> {
    store: Arc<S>,
    dispatcher: Arc<dyn EventDispatcher>,
    clock: Arc<dyn Clock>,
    config: SubscriptionsConfig,
}

impl<S> Clone for SubscriptionManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            dispatcher: Arc::clone(&self.dispatcher),
            clock: Arc::clone(&self.clock),
            config: self.config,
        }
    }
}

impl<S: EntitlementStore> SubscriptionManager<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<dyn EventDispatcher>,
        clock: Arc<dyn Clock>,
        config: SubscriptionsConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            config,
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &SubscriptionsConfig {
        &self.config
    }

    fn emit(&self, dispatch: Dispatch, event: SubscriptionEvent) {
        if dispatch.is_emit() {
            self.dispatcher.dispatch(event);
        }
    }

    async fn find_plan(&self, plan_id: Uuid) -> SubscriptionResult<Plan> {
        self.store
            .find_plan(plan_id)
            .await?
            .ok_or(SubscriptionError::PlanNotFound(plan_id))
    }

    // ========================================================================
    // Owner queries
    // ========================================================================

    pub async fn subscriptions(
        &self,
        owner: &impl SubscribableOwner,
        filter: SubscriptionFilter,
    ) -> SubscriptionResult<Vec<Subscription>> {
        let now = self.now();
        let all = self.store.subscriptions_of(&owner.owner_ref()).await?;
        Ok(all.into_iter().filter(|s| filter.matches(s, now)).collect())
    }

    async fn active_at(&self, owner: &OwnerRef, now: OffsetDateTime) -> SubscriptionResult<Option<Subscription>> {
        let all = self.store.subscriptions_of(owner).await?;
        Ok(all.into_iter().find(|s| s.is_active(now)))
    }

    /// Earliest-starting active subscription
    pub async fn active_subscription(&self, owner: &impl SubscribableOwner) -> SubscriptionResult<Option<Subscription>> {
        self.active_at(&owner.owner_ref(), self.now()).await
    }

    pub async fn upcoming_subscription(
        &self,
        owner: &impl SubscribableOwner,
    ) -> SubscriptionResult<Option<Subscription>> {
        let now = self.now();
        let all = self.store.subscriptions_of(&owner.owner_ref()).await?;
        Ok(all.into_iter().find(|s| s.is_upcoming(now)))
    }

    /// Most recently created subscription
    pub async fn latest_subscription(&self, owner: &impl SubscribableOwner) -> SubscriptionResult<Option<Subscription>> {
        let all = self.store.subscriptions_of(&owner.owner_ref()).await?;
        Ok(all.into_iter().max_by_key(|s| s.created_at))
    }

    /// The active subscription, or else the one that started last
    pub async fn active_or_last_subscription(
        &self,
        owner: &impl SubscribableOwner,
    ) -> SubscriptionResult<Option<Subscription>> {
        let now = self.now();
        let all = self.store.subscriptions_of(&owner.owner_ref()).await?;
        if let Some(active) = all.iter().find(|s| s.is_active(now)) {
            return Ok(Some(active.clone()));
        }
        Ok(all.into_iter().max_by_key(|s| s.starts_at))
    }

    pub async fn has_active_subscription(&self, owner: &impl SubscribableOwner) -> SubscriptionResult<bool> {
        Ok(self.active_subscription(owner).await?.is_some())
    }

    pub async fn has_upcoming_subscription(&self, owner: &impl SubscribableOwner) -> SubscriptionResult<bool> {
        Ok(self.upcoming_subscription(owner).await?.is_some())
    }

    pub async fn has_unpaid_subscriptions(&self, owner: &impl SubscribableOwner) -> SubscriptionResult<bool> {
        Ok(!self
            .subscriptions(owner, SubscriptionFilter::Unpaid)
            .await?
            .is_empty())
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    pub async fn subscribe_to(
        &self,
        owner: &impl SubscribableOwner,
        plan: &Plan,
        options: SubscribeOptions,
    ) -> SubscriptionResult<Subscription> {
        self.insert(
            owner.owner_ref(),
            plan,
            Insert {
                options,
                dispatch: Dispatch::Emit,
                mark_as_paid: false,
                renewal: false,
            },
            None,
        )
        .await
    }

    /// Create a subscription, optionally persisting a mutated predecessor in the same unit
    async fn insert(
        &self,
        owner: OwnerRef,
        plan: &Plan,
        insert: Insert,
        replacing: Option<&Subscription>,
    ) -> SubscriptionResult<Subscription> {
        let now = self.now();
        let options = insert.options;
        let duration_days = resolve_duration(plan, options.duration_days)?;

        let envelope = processor_for(plan.plan_type, duration_days).envelope(EnvelopeRequest {
            now,
            testing_days: options.testing_days,
            starts_at: options.starts_at,
        })?;

        let tolerance = self.config.payment_tolerance_days;
        let new = NewSubscription {
            plan_id: plan.id,
            owner,
            price: plan.price,
            currency: plan.currency.clone(),
            is_recurring: options.is_recurring,
            starts_at: envelope.starts_at,
            expires_at: envelope.expires_at,
            test_ends_at: envelope.test_ends_at,
            paid_at: (plan.is_free() || insert.mark_as_paid).then_some(now),
            payment_tolerance_ends_at: (tolerance > 0).then(|| add_days(now, i64::from(tolerance))),
            renewed_at: insert.renewal.then_some(now),
        };

        let window = new.window();
        let check = |existing: &[Subscription]| check_conflicts(existing, window, now);
        let subscription = match replacing {
            Some(previous) => self.store.replace_subscription(previous, new, now, &check).await?,
            None => self.store.insert_subscription(new, now, &check).await?,
        };

        info!(
            subscription_id = %subscription.id,
            owner = %subscription.owner,
            plan_id = %plan.id,
            starts_at = %subscription.starts_at,
            expires_at = %subscription.expires_at,
            "Subscription created"
        );
        self.emit(
            insert.dispatch,
            SubscriptionEvent::NewSubscription {
                subscription: subscription.clone(),
            },
        );
        Ok(subscription)
    }

    /// Replace the active subscription with one on `plan`.
    ///
    /// Deferred migrations start when the current cycle ends; a subscription still in
    /// its trial can only be migrated immediately.
    pub async fn migrate_subscription_to(
        &self,
        owner: &impl SubscribableOwner,
        plan: &Plan,
        options: MigrateOptions,
    ) -> SubscriptionResult<Subscription> {
        let owner_ref = owner.owner_ref();
        let now = self.now();
        let original = self
            .active_at(&owner_ref, now)
            .await?
            .ok_or(SubscriptionError::NoActiveSubscription)?;

        if !options.immediate && original.is_testing(now) {
            return Err(SubscriptionError::TestingMigrationMustBeImmediate);
        }
        let duration_days = resolve_duration(plan, options.duration_days)?;

        let starts_at = if options.immediate { now } else { original.expires_at };
        let mut previous = original;
        previous.cancel(options.immediate, now)?;

        let subscription = self
            .insert(
                owner_ref,
                plan,
                Insert {
                    options: SubscribeOptions {
                        is_recurring: options.is_recurring,
                        testing_days: 0,
                        duration_days: Some(duration_days),
                        starts_at: Some(starts_at),
                    },
                    dispatch: Dispatch::Suppress,
                    mark_as_paid: false,
                    renewal: false,
                },
                Some(&previous),
            )
            .await?;

        info!(
            previous_id = %previous.id,
            subscription_id = %subscription.id,
            owner = %subscription.owner,
            immediate = options.immediate,
            "Subscription migrated"
        );
        self.dispatcher.dispatch(SubscriptionEvent::SubscriptionMigrated {
            previous,
            subscription: subscription.clone(),
        });
        Ok(subscription)
    }

    /// Start a fresh cycle on the plan of the last subscription, once nothing is active
    pub async fn renew_expired_subscription(
        &self,
        owner: &impl SubscribableOwner,
        mark_as_paid: bool,
    ) -> SubscriptionResult<Subscription> {
        let owner_ref = owner.owner_ref();
        let now = self.now();
        let all = self.store.subscriptions_of(&owner_ref).await?;

        if all.iter().any(|s| s.is_active(now)) {
            return Err(SubscriptionError::ActiveSubscriptionExists);
        }
        let latest = all
            .into_iter()
            .max_by_key(|s| s.starts_at)
            .ok_or(SubscriptionError::NoSubscriptions)?;
        let plan = self.find_plan(latest.plan_id).await?;

        let subscription = self
            .insert(
                owner_ref,
                &plan,
                Insert {
                    options: SubscribeOptions {
                        is_recurring: latest.is_recurring,
                        testing_days: 0,
                        duration_days: Some(cycle_days(&latest)),
                        starts_at: None,
                    },
                    dispatch: Dispatch::Suppress,
                    mark_as_paid,
                    renewal: true,
                },
                None,
            )
            .await?;

        info!(
            subscription_id = %subscription.id,
            renewed_from = %latest.id,
            owner = %subscription.owner,
            "Expired subscription renewed"
        );
        self.dispatcher.dispatch(SubscriptionEvent::SubscriptionRenewed {
            subscription: subscription.clone(),
        });
        Ok(subscription)
    }

    /// Create the next cycle for an active subscription that expires at the end of tomorrow.
    ///
    /// The renewal starts the day after tomorrow; the current subscription runs out untouched.
    pub async fn renew_expiring_subscription(
        &self,
        owner: &impl SubscribableOwner,
        mark_as_paid: bool,
    ) -> SubscriptionResult<Subscription> {
        let owner_ref = owner.owner_ref();
        let now = self.now();
        let active = self
            .active_at(&owner_ref, now)
            .await?
            .ok_or(SubscriptionError::NoActiveSubscription)?;

        if !active.is_paid() {
            return Err(SubscriptionError::RenewalNotPaid);
        }
        if !active.is_expiring(now) {
            return Err(SubscriptionError::RenewalNotExpiring);
        }
        if !active.is_recurring {
            return Err(SubscriptionError::RenewalNotRecurring);
        }
        if active.is_pending_cancellation(now) {
            return Err(SubscriptionError::RenewalPendingCancellation);
        }

        let plan = self.find_plan(active.plan_id).await?;
        let subscription = self
            .insert(
                owner_ref,
                &plan,
                Insert {
                    options: SubscribeOptions {
                        is_recurring: true,
                        testing_days: 0,
                        duration_days: Some(cycle_days(&active)),
                        starts_at: Some(start_of_day(add_days(now, 2))),
                    },
                    dispatch: Dispatch::Suppress,
                    mark_as_paid,
                    renewal: true,
                },
                None,
            )
            .await?;

        info!(
            subscription_id = %subscription.id,
            renewed_from = %active.id,
            owner = %subscription.owner,
            starts_at = %subscription.starts_at,
            "Expiring subscription renewed"
        );
        self.dispatcher.dispatch(SubscriptionEvent::SubscriptionRenewed {
            subscription: subscription.clone(),
        });
        Ok(subscription)
    }

    pub async fn cancel_subscription(
        &self,
        owner: &impl SubscribableOwner,
        immediate: bool,
    ) -> SubscriptionResult<Subscription> {
        let now = self.now();
        let mut subscription = self
            .active_at(&owner.owner_ref(), now)
            .await?
            .ok_or(SubscriptionError::NoActiveSubscription)?;

        subscription.cancel(immediate, now)?;
        self.store.update_subscription(&subscription).await?;

        info!(
            subscription_id = %subscription.id,
            owner = %subscription.owner,
            immediate,
            "Subscription cancelled"
        );
        self.dispatcher.dispatch(SubscriptionEvent::SubscriptionCancelled {
            subscription: subscription.clone(),
        });
        Ok(subscription)
    }

    pub async fn extend_subscription(&self, owner: &impl SubscribableOwner, days: u32) -> SubscriptionResult<Subscription> {
        let now = self.now();
        let mut subscription = self
            .active_at(&owner.owner_ref(), now)
            .await?
            .ok_or(SubscriptionError::NoActiveSubscription)?;

        subscription.extend_by_days(days, now);
        self.store.update_subscription(&subscription).await?;
        self.extended(subscription)
    }

    pub async fn extend_subscription_to(
        &self,
        owner: &impl SubscribableOwner,
        date: OffsetDateTime,
    ) -> SubscriptionResult<Subscription> {
        let now = self.now();
        let mut subscription = self
            .active_at(&owner.owner_ref(), now)
            .await?
            .ok_or(SubscriptionError::NoActiveSubscription)?;

        subscription.extend_to(date, now);
        self.store.update_subscription(&subscription).await?;
        self.extended(subscription)
    }

    fn extended(&self, subscription: Subscription) -> SubscriptionResult<Subscription> {
        info!(
            subscription_id = %subscription.id,
            owner = %subscription.owner,
            expires_at = %subscription.expires_at,
            "Subscription extended"
        );
        self.dispatcher.dispatch(SubscriptionEvent::SubscriptionExtended {
            subscription: subscription.clone(),
        });
        Ok(subscription)
    }

    /// Record a payment. Calling it again only moves `paid_at`.
    pub async fn mark_as_paid(&self, subscription_id: Uuid) -> SubscriptionResult<Subscription> {
        let now = self.now();
        let mut subscription = self
            .store
            .find_subscription(subscription_id)
            .await?
            .ok_or(SubscriptionError::SubscriptionNotFound(subscription_id))?;

        subscription.mark_as_paid(now);
        self.store.update_subscription(&subscription).await?;

        info!(subscription_id = %subscription.id, owner = %subscription.owner, "Subscription paid");
        self.dispatcher
            .dispatch(SubscriptionEvent::SubscriptionPaymentSucceeded {
                subscription: subscription.clone(),
            });
        Ok(subscription)
    }

    pub async fn mark_as_refunded(&self, subscription_id: Uuid) -> SubscriptionResult<Subscription> {
        let now = self.now();
        let mut subscription = self
            .store
            .find_subscription(subscription_id)
            .await?
            .ok_or(SubscriptionError::SubscriptionNotFound(subscription_id))?;

        subscription.mark_as_refunded(now);
        self.store.update_subscription(&subscription).await?;

        info!(subscription_id = %subscription.id, owner = %subscription.owner, "Subscription refunded");
        Ok(subscription)
    }

    // ========================================================================
    // Relation limits
    // ========================================================================

    /// Limit on `relation` from the active plan. No active plan allows nothing;
    /// an active plan without a matching limit feature allows everything.
    async fn relation_allowance(&self, owner: &OwnerRef, relation: &str) -> SubscriptionResult<Remaining> {
        let Some(active) = self.active_at(owner, self.now()).await? else {
            return Ok(Remaining::Limited(0));
        };
        let plan = self.find_plan(active.plan_id).await?;
        Ok(plan
            .features
            .iter()
            .find(|f| f.restricts(&owner.owner_type, relation))
            .map_or(Remaining::Unlimited, |f| f.remaining_after(0)))
    }

    pub async fn usage_for<O>(&self, owner: &O, relation: &str) -> SubscriptionResult<RelationUsage>
    where
        O: RelationsLimitable,
    {
        let owner_ref = owner.owner_ref();
        let used = owner
            .relation_count(relation)
            .await?
            .ok_or_else(|| SubscriptionError::RelationNotFound {
                relation: relation.to_string(),
                owner_type: owner_ref.owner_type.clone(),
            })?;
        let available = self.relation_allowance(&owner_ref, relation).await?;
        Ok(RelationUsage::new(used, available))
    }

    /// Usage of every relation the active plan restricts for this owner type
    pub async fn usages_for<O>(&self, owner: &O) -> SubscriptionResult<Option<BTreeMap<String, RelationUsage>>>
    where
        O: RelationsLimitable,
    {
        let owner_ref = owner.owner_ref();
        let Some(active) = self.active_at(&owner_ref, self.now()).await? else {
            return Ok(None);
        };
        let plan = self.find_plan(active.plan_id).await?;
        let relations: Vec<String> = plan
            .features
            .iter()
            .filter(|f| f.is_limit())
            .filter_map(|f| f.restricted.as_ref())
            .filter(|r| r.model == owner_ref.owner_type)
            .map(|r| r.relation.clone())
            .collect();
        if relations.is_empty() {
            return Ok(None);
        }

        let mut usages = BTreeMap::new();
        for relation in relations {
            let usage = self.usage_for(owner, &relation).await?;
            usages.insert(relation, usage);
        }
        Ok(Some(usages))
    }
}
