//! Daily renewal sweep
//!
//! Selects recurring subscriptions expiring at the end of tomorrow and renews each
//! owner once, reporting against the owner's first candidate row. A failing owner is
//! recorded and the sweep moves on; only failing to list the candidates fails the
//! sweep as a whole.

use std::collections::HashSet;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, SubscriptionResult};
use crate::lifecycle::SubscriptionManager;
use crate::owner::OwnerRef;
use crate::store::EntitlementStore;
use crate::time_window::expiring_window;

/// Outcome of renewing one expiring subscription
#[derive(Debug, Clone, Serialize)]
pub enum RenewalResult {
    Renewed {
        subscription_id: Uuid,
        renewed_id: Uuid,
    },
    /// Renewal preconditions not met (unpaid, pending cancellation, already renewed)
    Skipped {
        subscription_id: Uuid,
        owner: OwnerRef,
        reason: String,
    },
    Failed {
        subscription_id: Uuid,
        owner: OwnerRef,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub started_at: OffsetDateTime,
    /// Expiring recurring rows found
    pub candidates: usize,
    /// Distinct owners among the candidates, one result each
    pub owners: usize,
    pub results: Vec<RenewalResult>,
}

impl SweepReport {
    pub fn renewed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, RenewalResult::Renewed { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, RenewalResult::Skipped { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, RenewalResult::Failed { .. }))
            .count()
    }
}

pub struct RenewalSweep<S> {
    manager: SubscriptionManager<S>,
    mark_as_paid: bool,
}

impl<S: EntitlementStore> RenewalSweep<S> {
    pub fn new(manager: SubscriptionManager<S>) -> Self {
        Self {
            manager,
            mark_as_paid: false,
        }
    }

    /// Mark renewals as paid on creation, for hosts that collect payment elsewhere
    pub fn marking_as_paid(mut self, mark_as_paid: bool) -> Self {
        self.mark_as_paid = mark_as_paid;
        self
    }

    pub async fn run(&self) -> SubscriptionResult<SweepReport> {
        let started_at = self.manager.now();
        let candidates = self
            .manager
            .store()
            .expiring_recurring(expiring_window(started_at))
            .await?;

        let mut seen = HashSet::new();
        let per_owner: Vec<_> = candidates
            .iter()
            .filter(|s| seen.insert(s.owner.clone()))
            .collect();

        info!(
            candidates = candidates.len(),
            owners = per_owner.len(),
            "Running renewal sweep"
        );

        let mut results = Vec::with_capacity(per_owner.len());
        for subscription in per_owner {
            let result = match self
                .manager
                .renew_expiring_subscription(&subscription.owner, self.mark_as_paid)
                .await
            {
                Ok(renewed) => RenewalResult::Renewed {
                    subscription_id: subscription.id,
                    renewed_id: renewed.id,
                },
                Err(e) if e.kind() == ErrorKind::Subscription => {
                    warn!(
                        subscription_id = %subscription.id,
                        owner = %subscription.owner,
                        reason = %e,
                        "Renewal skipped"
                    );
                    RenewalResult::Skipped {
                        subscription_id: subscription.id,
                        owner: subscription.owner.clone(),
                        reason: e.to_string(),
                    }
                }
                Err(e) => {
                    error!(
                        subscription_id = %subscription.id,
                        owner = %subscription.owner,
                        error = %e,
                        "Renewal failed"
                    );
                    RenewalResult::Failed {
                        subscription_id: subscription.id,
                        owner: subscription.owner.clone(),
                        error: e.to_string(),
                    }
                }
            };
            results.push(result);
        }

        let report = SweepReport {
            started_at,
            candidates: candidates.len(),
            owners: seen.len(),
            results,
        };
        info!(
            renewed = report.renewed(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Renewal sweep complete"
        );
        Ok(report)
    }
}
