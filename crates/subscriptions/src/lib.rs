// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Entitle Subscriptions Module
//!
//! Plans, subscriptions and metered features for any owner type that can hold a subscription.
//!
//! ## Features
//!
//! - **Plans**: Duration, monthly and yearly plans with authorization and limit features
//! - **Subscriptions**: Subscribe, migrate, renew, cancel and extend, with trials and payment tolerance
//! - **Feature Metering**: Atomic consumption against plan limits, optionally scoped per consumer
//! - **Relation Limits**: Compare an owner's relation counts against restricted features
//! - **Renewal Sweep**: Renew every recurring subscription expiring at the end of tomorrow
//! - **Invariants**: Read-only consistency checks over stored data
//! - **Events**: Lifecycle and usage events delivered through a pluggable dispatcher

pub mod config;
pub mod date_processor;
pub mod error;
pub mod events;
pub mod feature;
pub mod invariants;
pub mod ledger;
pub mod lifecycle;
pub mod owner;
pub mod plan;
pub mod store;
pub mod subscription;
pub mod sweep;
pub mod time_window;
pub mod usage;

#[cfg(test)]
mod edge_case_tests;

// Config
pub use config::{SubscriptionsConfig, PAYMENT_TOLERANCE_DAYS_ENV};

// Date processing
pub use date_processor::{
    processor_for, DateEnvelope, DurationProcessor, EnvelopeRequest, MonthlyProcessor,
    PlanTypeDateProcessor, YearlyProcessor,
};

// Error
pub use error::{ErrorKind, SubscriptionError, SubscriptionResult};

// Events
pub use events::{
    Dispatch, EventDispatcher, FeatureUsageEvent, RecordingDispatcher, SubscriptionEvent,
    TracingDispatcher,
};

// Plans and features
pub use feature::{Feature, FeatureKind, Remaining, RestrictedRelation};
pub use plan::{Plan, PlanListing, PlanState, PlanType};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::FeatureLedger;

// Lifecycle
pub use lifecycle::{MigrateOptions, SubscribeOptions, SubscriptionManager, DEFAULT_DURATION_DAYS};

// Owners
pub use owner::{OwnerRef, RelationUsage, RelationsLimitable, SubscribableOwner};

// Storage
pub use store::{EntitlementStore, InMemoryStore, PgStore, PlanStore, SubscriptionStore, UsageStore};

// Subscriptions
pub use subscription::{NewSubscription, Subscription, SubscriptionFilter};

// Sweep
pub use sweep::{RenewalResult, RenewalSweep, SweepReport};

// Time
pub use time_window::{Clock, FixedClock, SystemClock, TimeWindow};

// Usage
pub use usage::{FeatureUsageStat, ScopedUsage, Usage, UsageScope};

use std::sync::Arc;

use uuid::Uuid;

/// Main entry point that combines lifecycle, metering and invariant checks over one store
pub struct SubscriptionService<S> {
    pub manager: SubscriptionManager<S>,
    pub ledger: FeatureLedger<S>,
    pub invariants: InvariantChecker<S>,
    store: Arc<S>,
}

impl<S: EntitlementStore> SubscriptionService<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<dyn EventDispatcher>,
        clock: Arc<dyn Clock>,
        config: SubscriptionsConfig,
    ) -> Self {
        Self {
            manager: SubscriptionManager::new(
                Arc::clone(&store),
                Arc::clone(&dispatcher),
                Arc::clone(&clock),
                config,
            ),
            ledger: FeatureLedger::new(Arc::clone(&store), dispatcher),
            invariants: InvariantChecker::new(Arc::clone(&store), clock),
            store,
        }
    }

    /// Create a service on the system clock, with events logged through tracing and
    /// config read from the environment
    pub fn from_env(store: Arc<S>) -> SubscriptionResult<Self> {
        Ok(Self::new(
            store,
            Arc::new(TracingDispatcher),
            Arc::new(SystemClock),
            SubscriptionsConfig::from_env()?,
        ))
    }

    /// Renewal sweep sharing this service's store, clock and dispatcher
    pub fn renewal_sweep(&self) -> RenewalSweep<S> {
        RenewalSweep::new(self.manager.clone())
    }

    pub async fn plans(&self, listing: PlanListing) -> SubscriptionResult<Vec<Plan>> {
        self.store.list_plans(listing).await
    }

    pub async fn plan(&self, plan_id: Uuid) -> SubscriptionResult<Plan> {
        self.store
            .find_plan(plan_id)
            .await?
            .ok_or(SubscriptionError::PlanNotFound(plan_id))
    }

    pub async fn save_plan(&self, plan: &Plan) -> SubscriptionResult<()> {
        self.store.save_plan(plan).await
    }
}
