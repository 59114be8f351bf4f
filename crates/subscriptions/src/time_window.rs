//! Date arithmetic and clocks
//!
//! All boundaries are UTC. "End of day" is 23:59:59 without a sub-second part,
//! so stored expiry instants survive a round trip through second-precision columns.

use std::sync::Mutex;

use time::macros::time;
use time::{Date, Duration, Month, OffsetDateTime, Time};

use crate::error::{SubscriptionError, SubscriptionResult};

const END_OF_DAY: Time = time!(23:59:59);

pub fn start_of_day(instant: OffsetDateTime) -> OffsetDateTime {
    instant.replace_time(Time::MIDNIGHT)
}

pub fn end_of_day(instant: OffsetDateTime) -> OffsetDateTime {
    instant.replace_time(END_OF_DAY)
}

pub fn add_days(instant: OffsetDateTime, days: i64) -> OffsetDateTime {
    instant + Duration::days(days)
}

/// Add calendar months, clamping the day to the end of the target month.
pub fn add_months(instant: OffsetDateTime, months: i32) -> SubscriptionResult<OffsetDateTime> {
    let total = instant.year() * 12 + i32::from(u8::from(instant.month())) - 1 + months;
    let year = total.div_euclid(12);
    let month_number = u8::try_from(total.rem_euclid(12) + 1)
        .map_err(|e| SubscriptionError::InvalidArgument(format!("month out of range: {}", e)))?;
    let month = Month::try_from(month_number)
        .map_err(|e| SubscriptionError::InvalidArgument(format!("month out of range: {}", e)))?;
    let day = instant.day().min(time::util::days_in_year_month(year, month));
    let date = Date::from_calendar_date(year, month, day)
        .map_err(|e| SubscriptionError::InvalidArgument(format!("date out of range: {}", e)))?;
    Ok(instant.replace_date(date))
}

pub fn add_years(instant: OffsetDateTime, years: i32) -> SubscriptionResult<OffsetDateTime> {
    add_months(instant, years * 12)
}

/// Difference in calendar dates, ignoring the time of day. Negative when `to` is earlier.
pub fn calendar_days_between(from: OffsetDateTime, to: OffsetDateTime) -> i64 {
    (to.date() - from.date()).whole_days()
}

/// Absolute number of full 24h periods between two instants.
pub fn whole_days_between(a: OffsetDateTime, b: OffsetDateTime) -> i64 {
    (b - a).whole_days().abs()
}

pub fn tomorrow_end_of_day(now: OffsetDateTime) -> OffsetDateTime {
    end_of_day(add_days(now, 1))
}

/// Window in which an expiry counts as "expires at the end of tomorrow".
pub fn expiring_window(now: OffsetDateTime) -> TimeWindow {
    let target = tomorrow_end_of_day(now);
    TimeWindow::new(target - Duration::SECOND, target + Duration::SECOND)
}

/// Closed interval of instants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub starts_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
}

impl TimeWindow {
    pub fn new(starts_at: OffsetDateTime, ends_at: OffsetDateTime) -> Self {
        Self { starts_at, ends_at }
    }

    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        instant >= self.starts_at && instant <= self.ends_at
    }

    /// Windows that merely touch at a boundary do not overlap.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.starts_at < other.ends_at && other.starts_at < self.ends_at
    }
}

/// Source of "now" for every predicate and mutation
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Settable clock for tests and replays
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<OffsetDateTime>,
}

impl FixedClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
