//! Domain events and dispatch sinks
//!
//! The engine decides *which* events fire; delivery belongs to the host. Nested
//! operations (migration, renewal) pass [`Dispatch::Suppress`] to the inner call so
//! only the outer event is emitted.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::feature::{Feature, Remaining};
use crate::subscription::Subscription;
use crate::usage::UsageScope;

/// Payload of the feature metering events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureUsageEvent {
    pub subscription: Subscription,
    pub feature: Feature,
    pub amount: u64,
    /// Remaining allowance after the change
    pub remaining: Remaining,
    pub scope: Option<UsageScope>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    NewSubscription { subscription: Subscription },
    SubscriptionRenewed { subscription: Subscription },
    SubscriptionCancelled { subscription: Subscription },
    SubscriptionExtended { subscription: Subscription },
    SubscriptionMigrated {
        previous: Subscription,
        subscription: Subscription,
    },
    SubscriptionPaymentSucceeded { subscription: Subscription },
    FeatureConsumed(FeatureUsageEvent),
    FeatureUnconsumed(FeatureUsageEvent),
    FeatureUsageReset(FeatureUsageEvent),
}

impl SubscriptionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewSubscription { .. } => "new_subscription",
            Self::SubscriptionRenewed { .. } => "subscription_renewed",
            Self::SubscriptionCancelled { .. } => "subscription_cancelled",
            Self::SubscriptionExtended { .. } => "subscription_extended",
            Self::SubscriptionMigrated { .. } => "subscription_migrated",
            Self::SubscriptionPaymentSucceeded { .. } => "subscription_payment_succeeded",
            Self::FeatureConsumed(_) => "feature_consumed",
            Self::FeatureUnconsumed(_) => "feature_unconsumed",
            Self::FeatureUsageReset(_) => "feature_usage_reset",
        }
    }

    /// Subscription the event is about (the new one for migrations)
    pub fn subscription(&self) -> &Subscription {
        match self {
            Self::NewSubscription { subscription }
            | Self::SubscriptionRenewed { subscription }
            | Self::SubscriptionCancelled { subscription }
            | Self::SubscriptionExtended { subscription }
            | Self::SubscriptionMigrated { subscription, .. }
            | Self::SubscriptionPaymentSucceeded { subscription } => subscription,
            Self::FeatureConsumed(e) | Self::FeatureUnconsumed(e) | Self::FeatureUsageReset(e) => {
                &e.subscription
            }
        }
    }

    pub fn subscription_id(&self) -> Uuid {
        self.subscription().id
    }
}

/// Whether an operation emits its own event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Emit,
    Suppress,
}

impl Dispatch {
    pub fn is_emit(&self) -> bool {
        matches!(self, Dispatch::Emit)
    }
}

pub trait EventDispatcher: Send + Sync {
    fn dispatch(&self, event: SubscriptionEvent);
}

/// Logs every event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDispatcher;

impl EventDispatcher for TracingDispatcher {
    fn dispatch(&self, event: SubscriptionEvent) {
        let subscription = event.subscription();
        tracing::info!(
            event = event.name(),
            subscription_id = %subscription.id,
            owner = %subscription.owner,
            plan_id = %subscription.plan_id,
            "Subscription event"
        );
    }
}

/// Keeps every dispatched event in memory
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    events: Mutex<Vec<SubscriptionEvent>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SubscriptionEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(SubscriptionEvent::name)
            .collect()
    }

    /// Drain recorded events
    pub fn take(&self) -> Vec<SubscriptionEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl EventDispatcher for RecordingDispatcher {
    fn dispatch(&self, event: SubscriptionEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

impl EventDispatcher for UnboundedSender<SubscriptionEvent> {
    fn dispatch(&self, event: SubscriptionEvent) {
        if let Err(e) = self.send(event) {
            tracing::warn!(event = e.0.name(), "Event receiver dropped, event discarded");
        }
    }
}
