use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Money in minor units (cents).
pub type Cents = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Span {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// `completed` and `cancelled` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    /// pending → confirmed → completed, and pending|confirmed → cancelled.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, BookingStatus::Confirmed)
                | (BookingStatus::Confirmed, BookingStatus::Completed)
                | (BookingStatus::Pending, BookingStatus::Cancelled)
                | (BookingStatus::Confirmed, BookingStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Client,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub service_id: String,
    pub client_id: String,
    pub provider_id: String,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    /// Cancelled bookings no longer hold their slot.
    pub fn is_active(&self) -> bool {
        self.status != BookingStatus::Cancelled
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.client_id == user_id || self.provider_id == user_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub business_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: Cents,
    pub duration_minutes: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Business {
    pub id: String,
    pub provider_id: String,
    pub business_name: String,
    #[serde(default)]
    pub city: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub full_name: String,
    #[serde(default)]
    pub contact_number: Option<String>,
    pub user_type: UserType,
    #[serde(default, skip_serializing)]
    pub password_hash: String,
}

fn default_true() -> bool {
    true
}

/// Identity of the caller, as established by whatever authenticated the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_type: Option<UserType>,
}

impl Claims {
    pub fn new(user_id: impl Into<String>, user_type: UserType) -> Self {
        Self {
            user_id: Some(user_id.into()),
            user_type: Some(user_type),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn current_user_id(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn current_user_type(&self) -> Option<UserType> {
        self.user_type
    }

    pub fn is_authenticated(&self) -> bool {
        self.current_user_id().is_some()
    }
}

/// Every booking for one provider, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct ProviderLedger {
    pub provider_id: String,
    pub bookings: Vec<Booking>,
}

impl ProviderLedger {
    pub fn new(provider_id: String) -> Self {
        Self {
            provider_id,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings (of any status) whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// Ledger change record. This is the WAL record format and the payload of
/// the per-provider booking feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    BookingCreated {
        booking: Booking,
        idempotency_key: Option<String>,
    },
    BookingUpdated {
        booking: Booking,
    },
    BookingDeleted {
        id: Ulid,
        provider_id: String,
    },
}

impl Event {
    pub fn provider_id(&self) -> &str {
        match self {
            Event::BookingCreated { booking, .. } | Event::BookingUpdated { booking } => {
                &booking.provider_id
            }
            Event::BookingDeleted { provider_id, .. } => provider_id,
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBooking {
    pub service_id: String,
    pub start_time: DateTime<Utc>,
    /// Optional; when given it must match the service duration.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBooking {
    pub id: Ulid,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<BookingStatus>,
}

impl UpdateBooking {
    pub fn reschedules(&self) -> bool {
        self.start_time.is_some() || self.end_time.is_some()
    }
}

// ── Query result types ───────────────────────────────────────────

/// Optional bounds on a booking's start time. `start_date` is inclusive;
/// an `end_date` at exactly midnight covers that whole day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Exclusive upper bound after end-of-day widening.
    pub fn upper_bound(&self) -> Option<DateTime<Utc>> {
        self.end_date.map(|end| {
            let widen = if end.time() == chrono::NaiveTime::MIN {
                TimeDelta::days(1)
            } else {
                TimeDelta::nanoseconds(1)
            };
            end.checked_add_signed(widen).unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }

    pub fn contains(&self, start: DateTime<Utc>) -> bool {
        if let Some(lower) = self.start_date
            && start < lower
        {
            return false;
        }
        match self.upper_bound() {
            Some(upper) => start < upper,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingFilter {
    #[serde(default)]
    pub status: Option<BookingStatus>,
    #[serde(flatten)]
    pub range: DateRange,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.status.is_none_or(|s| s == booking.status) && self.range.contains(booking.span.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDetails {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: Option<String>,
    pub price: Cents,
    pub duration_minutes: i64,
    pub tags: Vec<String>,
}

impl From<&Service> for ServiceDetails {
    fn from(s: &Service) -> Self {
        Self {
            id: s.id.clone(),
            name: s.name.clone(),
            description: s.description.clone(),
            category: s.category.clone(),
            price: s.price,
            duration_minutes: s.duration_minutes,
            tags: s.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonDetails {
    pub id: String,
    pub full_name: String,
    pub email: String,
    pub contact_number: Option<String>,
}

impl From<&Profile> for PersonDetails {
    fn from(p: &Profile) -> Self {
        Self {
            id: p.id.clone(),
            full_name: p.full_name.clone(),
            email: p.email.clone(),
            contact_number: p.contact_number.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessDetails {
    pub id: String,
    pub business_name: String,
    pub city: String,
}

impl From<&Business> for BusinessDetails {
    fn from(b: &Business) -> Self {
        Self {
            id: b.id.clone(),
            business_name: b.business_name.clone(),
            city: b.city.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingWithDetails {
    pub booking: Booking,
    pub service: ServiceDetails,
    /// The client for provider listings, the provider for client listings.
    pub counterpart: PersonDetails,
    pub business: BusinessDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub confirmed: usize,
    pub completed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: BookingStatus) {
        match status {
            BookingStatus::Pending => self.pending += 1,
            BookingStatus::Confirmed => self.confirmed += 1,
            BookingStatus::Completed => self.completed += 1,
            BookingStatus::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub today_bookings: usize,
    pub week_bookings: usize,
    pub month_bookings: usize,
    pub total_bookings: usize,
    pub total_clients: usize,
    pub by_status: StatusCounts,
    pub monthly_revenue: Cents,
    pub average_booking_value: Cents,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularService {
    pub service_id: String,
    pub service_name: String,
    pub booking_count: usize,
    pub revenue: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInsights {
    pub stats: DashboardStats,
    pub popular_services: Vec<PopularService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentBooking {
    pub id: Ulid,
    pub service_name: String,
    pub start_time: DateTime<Utc>,
    pub status: BookingStatus,
    pub price: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    pub client: PersonDetails,
    pub total_bookings: usize,
    pub completed_bookings: usize,
    pub cancelled_bookings: usize,
    pub total_spent: Cents,
    pub first_visit: Option<DateTime<Utc>>,
    pub last_visit: Option<DateTime<Utc>>,
    pub favorite_service: Option<String>,
    pub recent_bookings: Vec<RecentBooking>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardClient {
    pub client: PersonDetails,
    pub total_bookings: usize,
    pub last_visit: Option<DateTime<Utc>>,
}

/// Field name → messages, ordered for stable output.
pub type FieldErrors = BTreeMap<String, Vec<String>>;
