//! Start/expiry/trial-end computation per plan type
//!
//! Every processor shares the same start and trial rules; they differ only in how
//! the expiration is advanced from the end-of-day normalized base.

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::plan::PlanType;
use crate::time_window::{add_days, add_months, add_years, calendar_days_between, end_of_day, start_of_day};

/// Dates of a new subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateEnvelope {
    pub starts_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub test_ends_at: Option<OffsetDateTime>,
}

/// Inputs shared by all processors
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeRequest {
    pub now: OffsetDateTime,
    pub testing_days: u32,
    pub starts_at: Option<OffsetDateTime>,
}

pub trait PlanTypeDateProcessor: Send + Sync {
    /// Advance the end-of-day base by one billing cycle
    fn advance(&self, base: OffsetDateTime) -> SubscriptionResult<OffsetDateTime>;

    fn envelope(&self, request: EnvelopeRequest) -> SubscriptionResult<DateEnvelope> {
        let EnvelopeRequest {
            now,
            testing_days,
            starts_at,
        } = request;
        let trial = i64::from(testing_days);

        let (start, offset_days) = match starts_at {
            Some(explicit) => (
                explicit,
                calendar_days_between(start_of_day(now), start_of_day(explicit)),
            ),
            None if trial > 0 => (add_days(now, trial), trial),
            None => (now, 0),
        };

        let test_ends_at = (trial > 0).then(|| add_days(now, trial));
        let base = end_of_day(add_days(now, offset_days));

        Ok(DateEnvelope {
            starts_at: start,
            expires_at: self.advance(base)?,
            test_ends_at,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DurationProcessor {
    pub days: u32,
}

impl PlanTypeDateProcessor for DurationProcessor {
    fn advance(&self, base: OffsetDateTime) -> SubscriptionResult<OffsetDateTime> {
        if self.days < 1 {
            return Err(SubscriptionError::InvalidArgument(format!(
                "duration must be at least one day, got {}",
                self.days
            )));
        }
        Ok(add_days(base, i64::from(self.days)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MonthlyProcessor;

impl PlanTypeDateProcessor for MonthlyProcessor {
    fn advance(&self, base: OffsetDateTime) -> SubscriptionResult<OffsetDateTime> {
        add_months(base, 1)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YearlyProcessor;

impl PlanTypeDateProcessor for YearlyProcessor {
    fn advance(&self, base: OffsetDateTime) -> SubscriptionResult<OffsetDateTime> {
        add_years(base, 1)
    }
}

/// Processor for a plan type. `duration_days` only matters for duration plans.
pub fn processor_for(plan_type: PlanType, duration_days: u32) -> Box<dyn PlanTypeDateProcessor> {
    match plan_type {
        PlanType::Duration => Box::new(DurationProcessor { days: duration_days }),
        PlanType::Monthly => Box::new(MonthlyProcessor),
        PlanType::Yearly => Box::new(YearlyProcessor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn request(now: OffsetDateTime, testing_days: u32, starts_at: Option<OffsetDateTime>) -> EnvelopeRequest {
        EnvelopeRequest {
            now,
            testing_days,
            starts_at,
        }
    }

    #[test]
    fn test_duration_without_trial() {
        let now = datetime!(2024-03-01 10:15:00 UTC);
        let envelope = DurationProcessor { days: 30 }
            .envelope(request(now, 0, None))
            .unwrap();

        assert_eq!(envelope.starts_at, now);
        assert_eq!(envelope.expires_at, datetime!(2024-03-31 23:59:59 UTC));
        assert_eq!(envelope.test_ends_at, None);
    }

    #[test]
    fn test_trial_shifts_start_and_expiry() {
        let now = datetime!(2024-03-01 10:15:00 UTC);
        let envelope = DurationProcessor { days: 10 }
            .envelope(request(now, 7, None))
            .unwrap();

        assert_eq!(envelope.starts_at, datetime!(2024-03-08 10:15:00 UTC));
        assert_eq!(envelope.test_ends_at, Some(datetime!(2024-03-08 10:15:00 UTC)));
        assert_eq!(envelope.expires_at, datetime!(2024-03-18 23:59:59 UTC));
    }

    #[test]
    fn test_explicit_start_offsets_by_calendar_days() {
        let now = datetime!(2024-03-01 22:00:00 UTC);
        let start = datetime!(2024-03-05 01:00:00 UTC);
        let envelope = MonthlyProcessor.envelope(request(now, 0, Some(start))).unwrap();

        assert_eq!(envelope.starts_at, start);
        assert_eq!(envelope.expires_at, datetime!(2024-04-05 23:59:59 UTC));
    }

    #[test]
    fn test_monthly_clamps_at_month_end() {
        let now = datetime!(2023-01-31 12:00:00 UTC);
        let envelope = MonthlyProcessor.envelope(request(now, 0, None)).unwrap();
        assert_eq!(envelope.expires_at, datetime!(2023-02-28 23:59:59 UTC));
    }

    #[test]
    fn test_yearly_adds_one_year() {
        let now = datetime!(2024-07-04 08:00:00 UTC);
        let envelope = YearlyProcessor.envelope(request(now, 0, None)).unwrap();
        assert_eq!(envelope.expires_at, datetime!(2025-07-04 23:59:59 UTC));
    }

    #[test]
    fn test_zero_duration_is_rejected() {
        let now = datetime!(2024-07-04 08:00:00 UTC);
        let err = processor_for(PlanType::Duration, 0)
            .envelope(request(now, 0, None))
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::InvalidArgument(_)));
    }
}
