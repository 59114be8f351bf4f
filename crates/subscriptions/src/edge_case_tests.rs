// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Subscription Engine
//!
//! Tests boundary conditions and race conditions in:
//! - Expiring window and cancellation boundaries
//! - Feature consumption limits, including concurrent consumers
//! - Overlap rejection and trial migrations
//! - End-to-end subscription scenarios

#[cfg(test)]
mod support {
    use std::sync::Arc;

    use time::macros::datetime;

    use crate::config::SubscriptionsConfig;
    use crate::events::{EventDispatcher, RecordingDispatcher};
    use crate::ledger::FeatureLedger;
    use crate::lifecycle::SubscriptionManager;
    use crate::owner::OwnerRef;
    use crate::plan::Plan;
    use crate::store::{InMemoryStore, PlanStore};
    use crate::time_window::{Clock, FixedClock};

    pub struct Engine {
        pub manager: SubscriptionManager<InMemoryStore>,
        pub ledger: FeatureLedger<InMemoryStore>,
        pub store: Arc<InMemoryStore>,
        pub recorder: Arc<RecordingDispatcher>,
        pub clock: Arc<FixedClock>,
    }

    pub fn engine() -> Engine {
        let store = Arc::new(InMemoryStore::new());
        let recorder = Arc::new(RecordingDispatcher::new());
        let clock = Arc::new(FixedClock::new(datetime!(2024-03-01 10:00:00 UTC)));
        let dispatcher: Arc<dyn EventDispatcher> = recorder.clone();
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        Engine {
            manager: SubscriptionManager::new(
                store.clone(),
                dispatcher.clone(),
                clock_dyn,
                SubscriptionsConfig::default(),
            ),
            ledger: FeatureLedger::new(store.clone(), dispatcher),
            store,
            recorder,
            clock,
        }
    }

    pub async fn saved(engine: &Engine, plan: Plan) -> Plan {
        engine.store.save_plan(&plan).await.unwrap();
        plan
    }

    pub fn owner(id: &str) -> OwnerRef {
        OwnerRef::new("user", id)
    }
}

#[cfg(test)]
mod boundary_tests {
    use time::macros::datetime;
    use time::Duration;

    use crate::subscription::tests::subscription_at;

    const NOW: time::OffsetDateTime = datetime!(2024-03-01 10:00:00 UTC);

    // =========================================================================
    // Expiry exactly at the end of tomorrow is expiring
    // =========================================================================
    #[test]
    fn test_expiring_at_tomorrow_end_of_day() {
        let sub = subscription_at(datetime!(2024-02-01 00:00:00 UTC), datetime!(2024-03-02 23:59:59 UTC));
        assert!(sub.is_expiring(NOW));
    }

    // =========================================================================
    // One second outside the window on either side is not expiring
    // =========================================================================
    #[test]
    fn test_expiring_window_edges() {
        let eod = datetime!(2024-03-02 23:59:59 UTC);
        for (offset, expected) in [(-2, false), (-1, true), (1, true), (2, false)] {
            let sub = subscription_at(datetime!(2024-02-01 00:00:00 UTC), eod + Duration::seconds(offset));
            assert_eq!(sub.is_expiring(NOW), expected, "offset {}s", offset);
        }
    }

    // =========================================================================
    // cancelled_at == now: effective cancellation wins over pending
    // =========================================================================
    #[test]
    fn test_cancellation_tie_is_effective() {
        let mut sub = subscription_at(datetime!(2024-02-01 00:00:00 UTC), datetime!(2024-03-31 23:59:59 UTC));
        sub.paid_at = Some(datetime!(2024-02-01 00:00:00 UTC));
        sub.cancelled_at = Some(NOW);

        assert!(sub.is_cancelled(NOW));
        assert!(!sub.is_pending_cancellation(NOW));
        assert!(!sub.is_active(NOW));
    }

    // =========================================================================
    // Deferred cancellation stays pending until expiry passes
    // =========================================================================
    #[test]
    fn test_deferred_cancellation_pending_until_expiry() {
        let mut sub = subscription_at(datetime!(2024-02-01 00:00:00 UTC), datetime!(2024-03-31 23:59:59 UTC));
        sub.paid_at = Some(datetime!(2024-02-01 00:00:00 UTC));
        sub.cancel(false, NOW).unwrap();

        assert_eq!(sub.cancelled_at, Some(sub.expires_at));
        assert!(sub.is_pending_cancellation(NOW));
        assert!(!sub.is_cancelled(NOW));
        assert!(sub.is_active(NOW));

        let after = sub.expires_at + Duration::seconds(1);
        assert!(sub.is_cancelled(after));
        assert!(!sub.is_pending_cancellation(after));
    }

    // =========================================================================
    // Unpaid subscription inside the tolerance window counts as active
    // =========================================================================
    #[test]
    fn test_payment_tolerance_boundary() {
        let mut sub = subscription_at(datetime!(2024-03-01 00:00:00 UTC), datetime!(2024-03-31 23:59:59 UTC));
        sub.payment_tolerance_ends_at = Some(datetime!(2024-03-04 10:00:00 UTC));

        assert!(sub.is_active(datetime!(2024-03-04 09:59:59 UTC)));
        assert!(!sub.is_active(datetime!(2024-03-04 10:00:00 UTC)));
    }
}

#[cfg(test)]
mod consumption_tests {
    use std::sync::Arc;

    use tokio::sync::Barrier;
    use uuid::Uuid;

    use super::support::*;
    use crate::error::SubscriptionError;
    use crate::feature::{Feature, Remaining};
    use crate::lifecycle::SubscribeOptions;
    use crate::plan::{Plan, PlanType};
    use crate::usage::UsageScope;

    async fn subscribed(engine: &Engine, limit: u64) -> crate::subscription::Subscription {
        let plan = saved(
            engine,
            Plan::new("Free", PlanType::Monthly, 0, "CHF")
                .with_feature(Feature::limit(Uuid::nil(), "api-calls", limit)),
        )
        .await;
        engine
            .manager
            .subscribe_to(&owner("1"), &plan, SubscribeOptions::default())
            .await
            .unwrap()
    }

    // =========================================================================
    // Consuming exactly the remaining amount succeeds
    // =========================================================================
    #[tokio::test]
    async fn test_consume_exactly_remaining() {
        let e = engine();
        let sub = subscribed(&e, 10).await;

        let remaining = e.ledger.consume_feature(&sub, "api-calls", 10, None).await.unwrap();
        assert_eq!(remaining, Remaining::Limited(0));

        let err = e.ledger.consume_feature(&sub, "api-calls", 1, None).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::UsageExceeded { remaining: 0, .. }));
    }

    // =========================================================================
    // limit == 0 is unlimited regardless of usage
    // =========================================================================
    #[tokio::test]
    async fn test_unlimited_feature_never_rejects() {
        let e = engine();
        let sub = subscribed(&e, 0).await;

        for _ in 0..5 {
            let remaining = e
                .ledger
                .consume_feature(&sub, "api-calls", 1_000_000, None)
                .await
                .unwrap();
            assert!(remaining.is_unlimited());
        }
    }

    // =========================================================================
    // Unconsume below zero clamps instead of failing
    // =========================================================================
    #[tokio::test]
    async fn test_unconsume_clamps_at_zero() {
        let e = engine();
        let sub = subscribed(&e, 10).await;
        e.ledger.consume_feature(&sub, "api-calls", 2, None).await.unwrap();

        let remaining = e.ledger.unconsume_feature(&sub, "api-calls", 5, None).await.unwrap();
        assert_eq!(remaining, Remaining::Limited(10));
        assert_eq!(e.ledger.usage_of(&sub, "api-calls", None).await.unwrap().used, 0);
    }

    // =========================================================================
    // Scoped consumers each get their own counter
    // =========================================================================
    #[tokio::test]
    async fn test_scopes_are_independent() {
        let e = engine();
        let sub = subscribed(&e, 3).await;
        let a = UsageScope::new("project", "a");
        let b = UsageScope::new("project", "b");

        e.ledger.consume_feature(&sub, "api-calls", 3, Some(&a)).await.unwrap();
        assert!(e.ledger.consume_feature(&sub, "api-calls", 1, Some(&a)).await.is_err());
        assert_eq!(
            e.ledger.consume_feature(&sub, "api-calls", 1, Some(&b)).await.unwrap(),
            Remaining::Limited(2)
        );
    }

    // =========================================================================
    // 20 parallel consumers against limit 10: exactly 10 succeed
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_never_over_consume() {
        let e = engine();
        let sub = subscribed(&e, 10).await;
        let barrier = Arc::new(Barrier::new(20));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = e.ledger.clone();
            let sub = sub.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger.consume_feature(&sub, "api-calls", 1, None).await.is_ok()
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 10, "Exactly the limit should be consumed");
        assert_eq!(e.ledger.usage_of(&sub, "api-calls", None).await.unwrap().used, 10);
        let consumed = e
            .recorder
            .names()
            .into_iter()
            .filter(|name| *name == "feature_consumed")
            .count();
        assert_eq!(consumed, 10);
    }
}

#[cfg(test)]
mod usage_property_tests {
    use proptest::prelude::*;
    use uuid::Uuid;

    use super::support::*;
    use crate::feature::Feature;
    use crate::lifecycle::SubscribeOptions;
    use crate::plan::{Plan, PlanType};

    const LIMIT: u64 = 10;

    fn run_ops(ops: Vec<(bool, u64)>) -> Vec<i64> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let e = engine();
            let plan = saved(
                &e,
                Plan::new("Free", PlanType::Monthly, 0, "CHF")
                    .with_feature(Feature::limit(Uuid::nil(), "seats", LIMIT)),
            )
            .await;
            let sub = e
                .manager
                .subscribe_to(&owner("1"), &plan, SubscribeOptions::default())
                .await
                .unwrap();

            let mut observed = Vec::with_capacity(ops.len());
            for (consume, amount) in ops {
                if consume {
                    let _ = e.ledger.consume_feature(&sub, "seats", amount, None).await;
                } else {
                    e.ledger.unconsume_feature(&sub, "seats", amount, None).await.unwrap();
                }
                observed.push(e.ledger.usage_of(&sub, "seats", None).await.unwrap().used);
            }
            observed
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn used_stays_within_zero_and_limit(ops in prop::collection::vec((any::<bool>(), 0u64..6), 1..40)) {
            for used in run_ops(ops) {
                prop_assert!(used >= 0);
                prop_assert!(used <= LIMIT as i64);
            }
        }
    }
}

#[cfg(test)]
mod lifecycle_edge_tests {
    use time::Duration;

    use super::support::*;
    use crate::error::SubscriptionError;
    use crate::lifecycle::{MigrateOptions, SubscribeOptions};
    use crate::plan::{Plan, PlanType};
    use crate::time_window::Clock;

    // =========================================================================
    // Start before the active expiry is rejected, start at the expiry is accepted
    // =========================================================================
    #[tokio::test]
    async fn test_overlap_rejected_before_expiry_accepted_at_expiry() {
        let e = engine();
        let plan = saved(&e, Plan::new("Free", PlanType::Monthly, 0, "CHF")).await;
        let active = e
            .manager
            .subscribe_to(&owner("1"), &plan, SubscribeOptions::default())
            .await
            .unwrap();

        let early = SubscribeOptions::default().starting_at(active.expires_at - Duration::seconds(1));
        let err = e.manager.subscribe_to(&owner("1"), &plan, early).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::ConflictingActiveSubscription));

        let at_expiry = SubscribeOptions::default().starting_at(active.expires_at);
        let next = e.manager.subscribe_to(&owner("1"), &plan, at_expiry).await.unwrap();
        assert_eq!(next.starts_at, active.expires_at);
    }

    // =========================================================================
    // A trial can only be migrated immediately
    // =========================================================================
    #[tokio::test]
    async fn test_trial_migration_requires_immediate() {
        let e = engine();
        let basic = saved(&e, Plan::new("Basic", PlanType::Monthly, 900, "CHF")).await;
        let pro = saved(&e, Plan::new("Pro", PlanType::Monthly, 1900, "CHF")).await;
        e.manager
            .subscribe_to(&owner("1"), &basic, SubscribeOptions::default().with_testing_days(14))
            .await
            .unwrap();

        let err = e
            .manager
            .migrate_subscription_to(&owner("1"), &pro, MigrateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::TestingMigrationMustBeImmediate));

        let migrated = e
            .manager
            .migrate_subscription_to(&owner("1"), &pro, MigrateOptions::immediate())
            .await
            .unwrap();
        assert_eq!(migrated.starts_at, e.clock.now());
        assert_eq!(migrated.plan_id, pro.id);
    }

    // =========================================================================
    // Double cancellation fails once the first one took effect
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_twice_fails() {
        let e = engine();
        let plan = saved(&e, Plan::new("Free", PlanType::Monthly, 0, "CHF")).await;
        e.manager
            .subscribe_to(&owner("1"), &plan, SubscribeOptions::default())
            .await
            .unwrap();

        e.manager.cancel_subscription(&owner("1"), true).await.unwrap();
        let err = e.manager.cancel_subscription(&owner("1"), true).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::NoActiveSubscription));
    }

    // =========================================================================
    // markAsPaid twice: still paid, one event per call
    // =========================================================================
    #[tokio::test]
    async fn test_mark_as_paid_is_idempotent() {
        let e = engine();
        let plan = saved(&e, Plan::new("Yearly", PlanType::Yearly, 29900, "CHF")).await;
        let sub = e
            .manager
            .subscribe_to(&owner("1"), &plan, SubscribeOptions::default())
            .await
            .unwrap();
        e.recorder.take();

        e.manager.mark_as_paid(sub.id).await.unwrap();
        let paid = e.manager.mark_as_paid(sub.id).await.unwrap();

        assert!(paid.is_paid());
        assert_eq!(
            e.recorder.names(),
            vec!["subscription_payment_succeeded", "subscription_payment_succeeded"]
        );
    }

    // =========================================================================
    // Zero-day duration plan is rejected
    // =========================================================================
    #[tokio::test]
    async fn test_zero_duration_rejected() {
        let e = engine();
        let plan = saved(&e, Plan::new("Pass", PlanType::Duration, 500, "CHF").with_duration_days(0)).await;
        let err = e
            .manager
            .subscribe_to(&owner("1"), &plan, SubscribeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::InvalidDuration(0)));
        assert!(e.manager.latest_subscription(&owner("1")).await.unwrap().is_none());
    }
}

#[cfg(test)]
mod scenario_tests {
    use time::macros::datetime;
    use uuid::Uuid;

    use super::support::*;
    use crate::feature::{Feature, Remaining};
    use crate::lifecycle::SubscribeOptions;
    use crate::plan::{Plan, PlanType};
    use crate::store::SubscriptionStore;
    use crate::sweep::RenewalSweep;
    use crate::time_window::{add_days, start_of_day, Clock};

    // =========================================================================
    // Yearly plan: inactive until paid
    // =========================================================================
    #[tokio::test]
    async fn test_yearly_subscription_active_after_payment() {
        let e = engine();
        let plan = saved(&e, Plan::new("Yearly", PlanType::Yearly, 29900, "CHF")).await;
        let sub = e
            .manager
            .subscribe_to(&owner("u"), &plan, SubscribeOptions::default())
            .await
            .unwrap();
        let now = e.clock.now();

        assert_eq!(sub.starts_at, now);
        assert_eq!(sub.expires_at, datetime!(2025-03-01 23:59:59 UTC));
        assert!(!sub.is_paid());
        assert!(!sub.is_active(now));

        let paid = e.manager.mark_as_paid(sub.id).await.unwrap();
        assert!(paid.is_active(now));
    }

    // =========================================================================
    // 30-day trial on a monthly plan: active while unpaid
    // =========================================================================
    #[tokio::test]
    async fn test_trial_is_active_without_payment() {
        let e = engine();
        let plan = saved(&e, Plan::new("Monthly", PlanType::Monthly, 900, "CHF")).await;
        let sub = e
            .manager
            .subscribe_to(&owner("u"), &plan, SubscribeOptions::default().with_testing_days(30))
            .await
            .unwrap();
        let now = e.clock.now();

        assert_eq!(sub.test_ends_at, Some(datetime!(2024-03-31 10:00:00 UTC)));
        assert_eq!(sub.starts_at, datetime!(2024-03-31 10:00:00 UTC));
        assert!(sub.is_testing(now));
        assert!(sub.is_active(now));
        assert!(e.manager.has_active_subscription(&owner("u")).await.unwrap());
    }

    // =========================================================================
    // Limit 10: consume 1, then 11 more is rejected and usage unchanged
    // =========================================================================
    #[tokio::test]
    async fn test_over_consumption_leaves_usage_unchanged() {
        let e = engine();
        let plan = saved(
            &e,
            Plan::new("Free", PlanType::Monthly, 0, "CHF").with_feature(Feature::limit(Uuid::nil(), "posts", 10)),
        )
        .await;
        let sub = e
            .manager
            .subscribe_to(&owner("u"), &plan, SubscribeOptions::default())
            .await
            .unwrap();

        assert_eq!(
            e.ledger.consume_feature(&sub, "posts", 1, None).await.unwrap(),
            Remaining::Limited(9)
        );
        assert!(e.ledger.consume_feature(&sub, "posts", 11, None).await.is_err());
        assert_eq!(e.ledger.usage_of(&sub, "posts", None).await.unwrap().used, 1);
    }

    // =========================================================================
    // Free plan is paid and active from creation
    // =========================================================================
    #[tokio::test]
    async fn test_free_plan_auto_paid() {
        let e = engine();
        let plan = saved(&e, Plan::new("Free", PlanType::Monthly, 0, "CHF")).await;
        let sub = e
            .manager
            .subscribe_to(&owner("u"), &plan, SubscribeOptions::default())
            .await
            .unwrap();

        assert!(sub.is_paid());
        assert!(sub.is_active(e.clock.now()));
    }

    // =========================================================================
    // Sweep renews the paid recurring row, skips the unpaid and one-off rows
    // =========================================================================
    #[tokio::test]
    async fn test_sweep_creates_single_upcoming_renewal() {
        let e = engine();
        let plan = saved(&e, Plan::new("Monthly", PlanType::Monthly, 900, "CHF")).await;

        let paid = e
            .manager
            .subscribe_to(&owner("paid"), &plan, SubscribeOptions::default())
            .await
            .unwrap();
        e.manager.mark_as_paid(paid.id).await.unwrap();
        e.manager
            .subscribe_to(&owner("unpaid"), &plan, SubscribeOptions::default())
            .await
            .unwrap();
        let one_off = e
            .manager
            .subscribe_to(&owner("one-off"), &plan, SubscribeOptions::default().recurring(false))
            .await
            .unwrap();
        e.manager.mark_as_paid(one_off.id).await.unwrap();

        e.clock.set(datetime!(2024-03-31 10:00:00 UTC));
        assert!(paid.is_expiring(e.clock.now()));

        let report = RenewalSweep::new(e.manager.clone()).run().await.unwrap();
        assert_eq!(report.renewed(), 1);
        assert_eq!(report.failed(), 0);

        let upcoming = e
            .manager
            .upcoming_subscription(&owner("paid"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(upcoming.starts_at, start_of_day(add_days(e.clock.now(), 2)));
        assert!(upcoming.is_renewed());
        assert!(e.manager.upcoming_subscription(&owner("unpaid")).await.unwrap().is_none());
        assert!(e.manager.upcoming_subscription(&owner("one-off")).await.unwrap().is_none());
        assert_eq!(e.store.list_subscriptions().await.unwrap().len(), 4);
    }
}
