use chrono::{DateTime, Months, NaiveTime, TimeDelta, Timelike, Utc};

use crate::limits::BookingPolicy;
use crate::model::{FieldErrors, Span};

use super::EngineError;

pub fn is_future_start(start: DateTime<Utc>, now: DateTime<Utc>, min_lead: TimeDelta) -> bool {
    now.checked_add_signed(min_lead)
        .is_some_and(|earliest| start > earliest)
}

pub fn is_within_horizon(start: DateTime<Utc>, now: DateTime<Utc>, max_horizon: Months) -> bool {
    match now.checked_add_months(max_horizon) {
        Some(limit) => start <= limit,
        None => false,
    }
}

pub fn is_aligned_to_interval(start: DateTime<Utc>, interval_minutes: u32) -> bool {
    interval_minutes > 0
        && start.minute() % interval_minutes == 0
        && start.second() == 0
        && start.nanosecond() == 0
}

/// Both bounds inclusive.
pub fn is_within_business_hours(
    start: DateTime<Utc>,
    earliest: NaiveTime,
    latest: NaiveTime,
) -> bool {
    let t = start.time();
    t >= earliest && t <= latest
}

pub fn is_valid_duration(
    duration_minutes: i64,
    min: i64,
    max: i64,
    strict_interval: Option<i64>,
) -> bool {
    if duration_minutes < min || duration_minutes > max {
        return false;
    }
    match strict_interval {
        Some(step) if step > 0 => duration_minutes % step == 0,
        _ => true,
    }
}

pub fn owns_resource(actor_id: &str, resource_owner_id: &str) -> bool {
    !actor_id.is_empty() && actor_id == resource_owner_id
}

/// Collects every failed rule instead of stopping at the first.
#[derive(Debug, Default)]
pub struct Violations(FieldErrors);

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, ok: bool, field: &str, message: impl Into<String>) {
        if !ok {
            self.0
                .entry(field.to_string())
                .or_default()
                .push(message.into());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<(), EngineError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(self.0))
        }
    }
}

/// Run every time rule against a proposed booking window.
pub fn validate_window(span: &Span, now: DateTime<Utc>, policy: &BookingPolicy) -> Result<(), EngineError> {
    let mut v = Violations::new();

    if span.is_empty() {
        v.check(false, "end_time", "End time must be after start time.");
        return v.into_result();
    }

    v.check(
        is_future_start(span.start, now, policy.min_lead),
        "start_time",
        format!(
            "Start time must be at least {} minutes in the future.",
            policy.min_lead.num_minutes()
        ),
    );
    v.check(
        is_within_horizon(span.start, now, policy.max_horizon),
        "start_time",
        "Start time cannot be more than 1 year in the future.",
    );
    v.check(
        is_aligned_to_interval(span.start, policy.slot_interval_minutes),
        "start_time",
        format!(
            "Start time must fall on {}-minute intervals.",
            policy.slot_interval_minutes
        ),
    );
    v.check(
        is_within_business_hours(span.start, policy.earliest_start, policy.latest_start),
        "start_time",
        format!(
            "Booking must start between {} and {}.",
            policy.earliest_start.format("%H:%M"),
            policy.latest_start.format("%H:%M")
        ),
    );
    let strict = policy
        .strict_duration
        .then_some(policy.slot_interval_minutes as i64);
    v.check(
        is_valid_duration(
            span.duration().num_minutes(),
            policy.min_duration_minutes,
            policy.max_duration_minutes,
            strict,
        ),
        "end_time",
        format!(
            "Duration must be between {} and {} minutes.",
            policy.min_duration_minutes, policy.max_duration_minutes
        ),
    );

    v.into_result()
}
