//! Feature metering against plan limits
//!
//! Consumption is guarded by the store's atomic check-and-increment, so two
//! concurrent consumers can never jointly exceed a limit.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::events::{EventDispatcher, FeatureUsageEvent, SubscriptionEvent};
use crate::feature::{Feature, FeatureKind, Remaining};
use crate::plan::Plan;
use crate::store::EntitlementStore;
use crate::subscription::Subscription;
use crate::usage::{FeatureUsageStat, IncrementOutcome, ScopedUsage, Usage, UsageKey, UsageScope};

pub struct FeatureLedger<S> {
    store: Arc<S>,
    dispatcher: Arc<dyn EventDispatcher>,
}

impl<S> Clone for FeatureLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

fn amount_as_i64(amount: u64) -> SubscriptionResult<i64> {
    i64::try_from(amount).map_err(|_| SubscriptionError::InvalidArgument(format!("amount {} is too large", amount)))
}

impl<S: EntitlementStore> FeatureLedger<S> {
    pub fn new(store: Arc<S>, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    async fn plan_of(&self, subscription: &Subscription) -> SubscriptionResult<Plan> {
        self.store
            .find_plan(subscription.plan_id)
            .await?
            .ok_or(SubscriptionError::PlanNotFound(subscription.plan_id))
    }

    pub async fn feature_by_code(&self, subscription: &Subscription, code: &str) -> SubscriptionResult<Feature> {
        let plan = self.plan_of(subscription).await?;
        plan.feature(code)
            .cloned()
            .ok_or_else(|| SubscriptionError::FeatureNotFound(code.to_string()))
    }

    async fn limit_feature(&self, subscription: &Subscription, code: &str) -> SubscriptionResult<Feature> {
        let feature = self.feature_by_code(subscription, code).await?;
        if feature.kind == FeatureKind::Feature {
            return Err(SubscriptionError::FeatureNotMeterable(code.to_string()));
        }
        Ok(feature)
    }

    /// Usage row for a limit feature, created at zero on first access
    pub async fn usage_of(
        &self,
        subscription: &Subscription,
        code: &str,
        scope: Option<&UsageScope>,
    ) -> SubscriptionResult<Usage> {
        self.limit_feature(subscription, code).await?;
        self.store
            .ensure_usage(&UsageKey::new(subscription.id, code, scope.cloned()))
            .await
    }

    pub async fn remaining_of(
        &self,
        subscription: &Subscription,
        code: &str,
        scope: Option<&UsageScope>,
    ) -> SubscriptionResult<Remaining> {
        let feature = self.limit_feature(subscription, code).await?;
        let key = UsageKey::new(subscription.id, code, scope.cloned());
        let used = self.store.find_usage(&key).await?.map_or(0, |u| u.used);
        Ok(feature.remaining_after(used))
    }

    pub async fn has_available(
        &self,
        subscription: &Subscription,
        code: &str,
        amount: u64,
        scope: Option<&UsageScope>,
    ) -> SubscriptionResult<bool> {
        Ok(self.remaining_of(subscription, code, scope).await?.allows(amount))
    }

    /// Consume `amount` of a limit feature. Returns what is left afterwards.
    pub async fn consume_feature(
        &self,
        subscription: &Subscription,
        code: &str,
        amount: u64,
        scope: Option<&UsageScope>,
    ) -> SubscriptionResult<Remaining> {
        let feature = self.limit_feature(subscription, code).await?;
        let key = UsageKey::new(subscription.id, code, scope.cloned());

        match self
            .store
            .try_increment(&key, amount_as_i64(amount)?, feature.ceiling())
            .await?
        {
            IncrementOutcome::Applied { used } => {
                let remaining = feature.remaining_after(used);
                info!(
                    subscription_id = %subscription.id,
                    feature = %code,
                    amount,
                    used,
                    "Feature consumed"
                );
                self.dispatcher
                    .dispatch(SubscriptionEvent::FeatureConsumed(FeatureUsageEvent {
                        subscription: subscription.clone(),
                        feature,
                        amount,
                        remaining,
                        scope: key.scope,
                    }));
                Ok(remaining)
            }
            IncrementOutcome::Rejected { used } => {
                let remaining = feature.remaining_after(used).as_limited().unwrap_or(i64::MAX);
                debug!(
                    subscription_id = %subscription.id,
                    feature = %code,
                    amount,
                    remaining,
                    "Feature consumption rejected"
                );
                Err(SubscriptionError::UsageExceeded {
                    code: code.to_string(),
                    requested: amount,
                    remaining,
                })
            }
        }
    }

    /// Give back `amount`. Over-returning clamps usage at zero.
    pub async fn unconsume_feature(
        &self,
        subscription: &Subscription,
        code: &str,
        amount: u64,
        scope: Option<&UsageScope>,
    ) -> SubscriptionResult<Remaining> {
        let feature = self.limit_feature(subscription, code).await?;
        let key = UsageKey::new(subscription.id, code, scope.cloned());

        let usage = self
            .store
            .decrement_clamped(&key, amount_as_i64(amount)?)
            .await?;
        let remaining = feature.remaining_after(usage.used);

        info!(
            subscription_id = %subscription.id,
            feature = %code,
            amount,
            used = usage.used,
            "Feature unconsumed"
        );
        self.dispatcher
            .dispatch(SubscriptionEvent::FeatureUnconsumed(FeatureUsageEvent {
                subscription: subscription.clone(),
                feature,
                amount,
                remaining,
                scope: key.scope,
            }));
        Ok(remaining)
    }

    pub async fn reset_feature_usage(
        &self,
        subscription: &Subscription,
        code: &str,
        scope: Option<&UsageScope>,
    ) -> SubscriptionResult<Remaining> {
        let feature = self.limit_feature(subscription, code).await?;
        let key = UsageKey::new(subscription.id, code, scope.cloned());

        let previous = self.store.find_usage(&key).await?.map_or(0, |u| u.used);
        let usage = self.store.reset_usage(&key).await?;
        let remaining = feature.remaining_after(usage.used);

        info!(
            subscription_id = %subscription.id,
            feature = %code,
            previous,
            "Feature usage reset"
        );
        self.dispatcher
            .dispatch(SubscriptionEvent::FeatureUsageReset(FeatureUsageEvent {
                subscription: subscription.clone(),
                feature,
                amount: u64::try_from(previous).unwrap_or(0),
                remaining,
                scope: key.scope,
            }));
        Ok(remaining)
    }

    /// Usage summary of every limit feature on the subscription's plan
    pub async fn feature_usage_stats(&self, subscription: &Subscription) -> SubscriptionResult<Vec<FeatureUsageStat>> {
        let plan = self.plan_of(subscription).await?;
        let usages = self.store.usages_of(subscription.id).await?;

        let mut by_code: BTreeMap<&str, Vec<&Usage>> = BTreeMap::new();
        for usage in &usages {
            by_code.entry(usage.code.as_str()).or_default().push(usage);
        }

        Ok(plan
            .features
            .iter()
            .filter(|f| f.is_limit())
            .map(|feature| {
                let rows = by_code.get(feature.code.as_str()).map(Vec::as_slice).unwrap_or(&[]);
                let used: i64 = rows.iter().map(|u| u.used).sum();
                let scopes = rows
                    .iter()
                    .filter_map(|u| {
                        u.scope.as_ref().map(|scope| ScopedUsage {
                            scope: scope.clone(),
                            used: u.used,
                            remaining: feature.remaining_after(u.used),
                        })
                    })
                    .collect();
                FeatureUsageStat {
                    code: feature.code.clone(),
                    limit: feature.limit,
                    used,
                    remaining: feature.remaining_after(used),
                    scopes,
                }
            })
            .collect())
    }

    /// Codes of the plain authorizations granted by the subscription's plan
    pub async fn feature_authorizations(&self, subscription: &Subscription) -> SubscriptionResult<Vec<String>> {
        let plan = self.plan_of(subscription).await?;
        Ok(plan
            .features
            .iter()
            .filter(|f| f.kind == FeatureKind::Feature)
            .map(|f| f.code.clone())
            .collect())
    }
}
