use chrono::{Months, NaiveTime, TimeDelta};

pub const MAX_BOOKINGS_PER_PROVIDER: usize = 100_000;
pub const MAX_ID_LEN: usize = 128;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
/// Longest accepted request line on the wire, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
pub const POPULAR_SERVICES_LIMIT: usize = 5;
pub const RECENT_BOOKINGS_LIMIT: usize = 5;
/// Upper bound for a configured booking lead time: one week.
pub const MAX_MIN_LEAD_MINUTES: i64 = 7 * 24 * 60;

/// Time rules applied to every booking window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingPolicy {
    /// A booking must start strictly later than `now + min_lead`.
    pub min_lead: TimeDelta,
    /// A booking may not start later than `now + max_horizon`.
    pub max_horizon: Months,
    /// Start times sit on this minute grid.
    pub slot_interval_minutes: u32,
    pub earliest_start: NaiveTime,
    pub latest_start: NaiveTime,
    pub min_duration_minutes: i64,
    pub max_duration_minutes: i64,
    /// When set, durations must also be a multiple of `slot_interval_minutes`.
    pub strict_duration: bool,
    /// Allowed drift between a client-supplied end time and the computed one.
    pub end_time_tolerance: TimeDelta,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            min_lead: TimeDelta::minutes(30),
            max_horizon: Months::new(12),
            slot_interval_minutes: 15,
            earliest_start: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN),
            latest_start: NaiveTime::from_hms_opt(23, 0, 0).unwrap_or(NaiveTime::MIN),
            min_duration_minutes: 15,
            max_duration_minutes: 480,
            strict_duration: false,
            end_time_tolerance: TimeDelta::minutes(1),
        }
    }
}
