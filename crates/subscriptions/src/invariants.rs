//! Subscription Invariants Module
//!
//! Runnable consistency checks over the backing store. They only read, so they can
//! be run after any batch of mutations or after importing data from elsewhere.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::owner::OwnerRef;
use crate::plan::Plan;
use crate::store::EntitlementStore;
use crate::subscription::Subscription;
use crate::time_window::Clock;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Subscription(s) affected
    pub subscription_ids: Vec<Uuid>,
    pub owner: Option<OwnerRef>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// How a violation affects what owners can use
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Possible after legitimate operations such as a plan downgrade
    Advisory,
    /// Stored rows disagree with each other but access is unaffected for now
    Inconsistent,
    /// An owner is granted or denied features incorrectly
    Entitlement,
}

impl ViolationSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationSeverity::Advisory => "advisory",
            ViolationSeverity::Inconsistent => "inconsistent",
            ViolationSeverity::Entitlement => "entitlement",
        }
    }

    /// Whether owners currently see wrong entitlements because of it
    pub fn affects_access(&self) -> bool {
        matches!(self, ViolationSeverity::Entitlement)
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one full pass over the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_failed: usize,
    pub subscriptions_checked: usize,
    /// Owners named by at least one violation, in order
    pub affected_owners: Vec<OwnerRef>,
    /// Owners whose entitlements are wrong right now
    pub owners_with_wrong_access: Vec<OwnerRef>,
    pub violations: Vec<InvariantViolation>,
}

impl InvariantCheckSummary {
    pub fn healthy(&self) -> bool {
        self.violations.is_empty()
    }

    /// The violations recorded against one owner
    pub fn violations_for<'a>(&'a self, owner: &'a OwnerRef) -> impl Iterator<Item = &'a InvariantViolation> + 'a {
        self.violations
            .iter()
            .filter(move |v| v.owner.as_ref() == Some(owner))
    }
}

const CHECKS: [&str; 6] = [
    "single_active_coverage",
    "usage_non_negative",
    "usage_within_limit",
    "cancelled_not_recurring",
    "free_subscription_paid",
    "expiry_after_start",
];

pub struct InvariantChecker<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: EntitlementStore> InvariantChecker<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> SubscriptionResult<InvariantCheckSummary> {
        let now = self.clock.now();
        let subscriptions_checked = self.store.list_subscriptions().await?.len();
        let mut violations = Vec::new();

        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }

        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();
        let affected_owners: BTreeSet<OwnerRef> = violations.iter().filter_map(|v| v.owner.clone()).collect();
        let owners_with_wrong_access: BTreeSet<OwnerRef> = violations
            .iter()
            .filter(|v| v.severity.affects_access())
            .filter_map(|v| v.owner.clone())
            .collect();

        if !violations.is_empty() {
            tracing::warn!(
                violations = violations.len(),
                checks_failed,
                owners = affected_owners.len(),
                owners_with_wrong_access = owners_with_wrong_access.len(),
                "Subscription invariants violated"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run: CHECKS.len(),
            checks_failed,
            subscriptions_checked,
            affected_owners: affected_owners.into_iter().collect(),
            owners_with_wrong_access: owners_with_wrong_access.into_iter().collect(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> SubscriptionResult<Vec<InvariantViolation>> {
        match name {
            "single_active_coverage" => self.check_single_active_coverage().await,
            "usage_non_negative" => self.check_usage_non_negative().await,
            "usage_within_limit" => self.check_usage_within_limit().await,
            "cancelled_not_recurring" => self.check_cancelled_not_recurring().await,
            "free_subscription_paid" => self.check_free_subscription_paid().await,
            "expiry_after_start" => self.check_expiry_after_start().await,
            other => Err(SubscriptionError::InvalidArgument(format!(
                "unknown invariant check '{}'",
                other
            ))),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    /// Invariant 1: an owner's active subscriptions never cover the same instant twice
    ///
    /// A successor starting at its predecessor's expiry counts as started for the whole
    /// of that day, so two active rows are fine as long as their windows only touch.
    async fn check_single_active_coverage(&self) -> SubscriptionResult<Vec<InvariantViolation>> {
        let now = self.clock.now();
        let mut by_owner: BTreeMap<OwnerRef, Vec<Subscription>> = BTreeMap::new();
        for subscription in self.store.list_subscriptions().await? {
            if subscription.is_active(now) {
                by_owner
                    .entry(subscription.owner.clone())
                    .or_default()
                    .push(subscription);
            }
        }

        let mut violations = Vec::new();
        for (owner, active) in by_owner {
            let overlapping: Vec<&Subscription> = active
                .iter()
                .filter(|a| {
                    active
                        .iter()
                        .any(|b| a.id != b.id && a.window().overlaps(&b.window()))
                })
                .collect();
            if overlapping.is_empty() {
                continue;
            }

            violations.push(InvariantViolation {
                invariant: "single_active_coverage".to_string(),
                description: format!(
                    "Owner {} has {} active subscriptions with overlapping periods",
                    owner,
                    overlapping.len()
                ),
                context: serde_json::json!({
                    "periods": overlapping
                        .iter()
                        .map(|s| serde_json::json!({
                            "subscription_id": s.id,
                            "starts_at": s.starts_at.to_string(),
                            "expires_at": s.expires_at.to_string(),
                        }))
                        .collect::<Vec<_>>(),
                }),
                subscription_ids: overlapping.iter().map(|s| s.id).collect(),
                owner: Some(owner),
                severity: ViolationSeverity::Entitlement,
            });
        }
        Ok(violations)
    }

    /// Invariant 2: usage counters never go below zero
    async fn check_usage_non_negative(&self) -> SubscriptionResult<Vec<InvariantViolation>> {
        Ok(self
            .store
            .list_usages()
            .await?
            .into_iter()
            .filter(|u| u.used < 0)
            .map(|u| InvariantViolation {
                invariant: "usage_non_negative".to_string(),
                subscription_ids: vec![u.subscription_id],
                owner: None,
                description: format!("Usage of '{}' is negative ({})", u.code, u.used),
                context: serde_json::json!({ "code": u.code, "used": u.used, "scope": u.scope }),
                severity: ViolationSeverity::Entitlement,
            })
            .collect())
    }

    /// Invariant 3: usage does not exceed the plan limit
    ///
    /// Can legitimately happen after a migration to a smaller plan, hence medium.
    async fn check_usage_within_limit(&self) -> SubscriptionResult<Vec<InvariantViolation>> {
        let subscriptions: HashMap<Uuid, Subscription> = self
            .store
            .list_subscriptions()
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        let mut plans: HashMap<Uuid, Option<Plan>> = HashMap::new();
        let mut violations = Vec::new();

        for usage in self.store.list_usages().await? {
            let Some(subscription) = subscriptions.get(&usage.subscription_id) else {
                continue;
            };
            if !plans.contains_key(&subscription.plan_id) {
                let plan = self.store.find_plan(subscription.plan_id).await?;
                plans.insert(subscription.plan_id, plan);
            }
            let limit = plans
                .get(&subscription.plan_id)
                .and_then(Option::as_ref)
                .and_then(|p| p.feature(&usage.code))
                .and_then(|f| f.ceiling());

            if let Some(limit) = limit.filter(|l| usage.used > *l) {
                violations.push(InvariantViolation {
                    invariant: "usage_within_limit".to_string(),
                    subscription_ids: vec![subscription.id],
                    owner: Some(subscription.owner.clone()),
                    description: format!("Usage of '{}' is {} but the limit is {}", usage.code, usage.used, limit),
                    context: serde_json::json!({
                        "code": usage.code,
                        "used": usage.used,
                        "limit": limit,
                        "scope": usage.scope,
                    }),
                    severity: ViolationSeverity::Advisory,
                });
            }
        }
        Ok(violations)
    }

    /// Invariant 4: a cancelled subscription is never renewed automatically
    async fn check_cancelled_not_recurring(&self) -> SubscriptionResult<Vec<InvariantViolation>> {
        Ok(self
            .store
            .list_subscriptions()
            .await?
            .into_iter()
            .filter(|s| s.cancelled_at.is_some() && s.is_recurring)
            .map(|s| InvariantViolation {
                invariant: "cancelled_not_recurring".to_string(),
                subscription_ids: vec![s.id],
                description: format!("Subscription {} is cancelled but still recurring", s.id),
                context: serde_json::json!({ "cancelled_at": s.cancelled_at }),
                owner: Some(s.owner),
                severity: ViolationSeverity::Inconsistent,
            })
            .collect())
    }

    /// Invariant 5: free subscriptions are paid from the start
    async fn check_free_subscription_paid(&self) -> SubscriptionResult<Vec<InvariantViolation>> {
        Ok(self
            .store
            .list_subscriptions()
            .await?
            .into_iter()
            .filter(|s| s.price == 0 && !s.is_paid())
            .map(|s| InvariantViolation {
                invariant: "free_subscription_paid".to_string(),
                subscription_ids: vec![s.id],
                description: format!("Free subscription {} has no payment date", s.id),
                context: serde_json::json!({ "plan_id": s.plan_id }),
                owner: Some(s.owner),
                severity: ViolationSeverity::Advisory,
            })
            .collect())
    }

    /// Invariant 6: a subscription never expires before it starts
    async fn check_expiry_after_start(&self) -> SubscriptionResult<Vec<InvariantViolation>> {
        Ok(self
            .store
            .list_subscriptions()
            .await?
            .into_iter()
            .filter(|s| s.expires_at < s.starts_at)
            .map(|s| InvariantViolation {
                invariant: "expiry_after_start".to_string(),
                subscription_ids: vec![s.id],
                description: format!("Subscription {} expires before it starts", s.id),
                context: serde_json::json!({
                    "starts_at": s.starts_at.to_string(),
                    "expires_at": s.expires_at.to_string(),
                }),
                owner: Some(s.owner),
                severity: ViolationSeverity::Inconsistent,
            })
            .collect())
    }
}
