//! Subscription record and its time-derived state
//!
//! Nothing derived is stored. Every predicate takes the instant to evaluate against,
//! so the same row can be inspected at any point of its life.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::owner::OwnerRef;
use crate::time_window::{add_days, end_of_day, expiring_window, start_of_day, whole_days_between, TimeWindow};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub owner: OwnerRef,
    /// Snapshot of the plan price at subscription time
    pub price: i64,
    pub currency: String,
    pub is_recurring: bool,
    pub starts_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub test_ends_at: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
    pub payment_tolerance_ends_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub refunded_at: Option<OffsetDateTime>,
    /// Set on subscriptions created by a renewal
    pub renewed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Fields of a subscription about to be inserted
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub plan_id: Uuid,
    pub owner: OwnerRef,
    pub price: i64,
    pub currency: String,
    pub is_recurring: bool,
    pub starts_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub test_ends_at: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
    pub payment_tolerance_ends_at: Option<OffsetDateTime>,
    pub renewed_at: Option<OffsetDateTime>,
}

impl NewSubscription {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.starts_at, self.expires_at)
    }

    pub fn into_subscription(self, now: OffsetDateTime) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            plan_id: self.plan_id,
            owner: self.owner,
            price: self.price,
            currency: self.currency,
            is_recurring: self.is_recurring,
            starts_at: self.starts_at,
            expires_at: self.expires_at,
            test_ends_at: self.test_ends_at,
            paid_at: self.paid_at,
            payment_tolerance_ends_at: self.payment_tolerance_ends_at,
            cancelled_at: None,
            refunded_at: None,
            renewed_at: self.renewed_at,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Owner-level subscription selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionFilter {
    All,
    Active,
    Upcoming,
    Testing,
    Paid,
    Unpaid,
    Recurring,
}

impl SubscriptionFilter {
    pub fn matches(&self, subscription: &Subscription, now: OffsetDateTime) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Active => subscription.is_active(now),
            SubscriptionFilter::Upcoming => subscription.is_upcoming(now),
            SubscriptionFilter::Testing => subscription.is_testing(now),
            SubscriptionFilter::Paid => subscription.is_paid(),
            SubscriptionFilter::Unpaid => !subscription.is_paid(),
            SubscriptionFilter::Recurring => subscription.is_recurring,
        }
    }
}

impl Subscription {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.starts_at, self.expires_at)
    }

    pub fn has_started(&self, now: OffsetDateTime) -> bool {
        now >= start_of_day(self.starts_at)
    }

    pub fn is_testing(&self, now: OffsetDateTime) -> bool {
        self.test_ends_at.is_some_and(|ends| now < ends)
    }

    pub fn is_paid(&self) -> bool {
        self.paid_at.is_some()
    }

    pub fn is_within_payment_tolerance(&self, now: OffsetDateTime) -> bool {
        self.payment_tolerance_ends_at.is_some_and(|ends| now < ends)
    }

    /// Cancellation has taken effect. At `cancelled_at == now` this wins over pending.
    pub fn is_cancelled(&self, now: OffsetDateTime) -> bool {
        self.cancelled_at.is_some_and(|at| at <= now)
    }

    pub fn is_pending_cancellation(&self, now: OffsetDateTime) -> bool {
        self.cancelled_at.is_some_and(|at| at > now)
    }

    pub fn is_refunded(&self) -> bool {
        self.refunded_at.is_some()
    }

    pub fn is_renewed(&self) -> bool {
        self.renewed_at.is_some()
    }

    pub fn has_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Expires at the end of tomorrow, give or take a second
    pub fn is_expiring(&self, now: OffsetDateTime) -> bool {
        expiring_window(now).contains(self.expires_at)
    }

    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        if self.is_testing(now) {
            return true;
        }
        self.has_started(now)
            && (self.is_paid() || self.is_within_payment_tolerance(now))
            && !self.has_expired(now)
            && !self.is_cancelled(now)
            && !self.is_refunded()
    }

    pub fn is_upcoming(&self, now: OffsetDateTime) -> bool {
        !self.has_started(now) && !self.is_cancelled(now) && !self.is_refunded()
    }

    pub fn remaining_days(&self, now: OffsetDateTime) -> SubscriptionResult<i64> {
        if !self.has_started(now) {
            return Err(SubscriptionError::NotStarted);
        }
        if self.has_expired(now) {
            return Ok(0);
        }
        Ok(whole_days_between(now, self.expires_at))
    }

    /// Length of the billing cycle in whole days, reused when renewing
    pub fn duration_days(&self) -> i64 {
        whole_days_between(self.starts_at, self.expires_at)
    }

    pub fn mark_as_paid(&mut self, now: OffsetDateTime) {
        self.paid_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_as_refunded(&mut self, now: OffsetDateTime) {
        self.refunded_at = Some(now);
        self.is_recurring = false;
        self.updated_at = now;
    }

    /// Cancel now or at the end of the current cycle. A running trial is collapsed first.
    pub fn cancel(&mut self, immediate: bool, now: OffsetDateTime) -> SubscriptionResult<()> {
        if self.is_cancelled(now) {
            return Err(SubscriptionError::AlreadyCancelled);
        }
        if self.is_testing(now) {
            self.starts_at = now;
            self.test_ends_at = Some(now);
        }
        self.cancelled_at = Some(if immediate { now } else { self.expires_at });
        self.is_recurring = false;
        self.updated_at = now;
        Ok(())
    }

    pub fn extend_by_days(&mut self, days: u32, now: OffsetDateTime) {
        self.expires_at = end_of_day(add_days(self.expires_at, i64::from(days)));
        self.updated_at = now;
    }

    pub fn extend_to(&mut self, date: OffsetDateTime, now: OffsetDateTime) {
        self.expires_at = end_of_day(date);
        self.updated_at = now;
    }
}
