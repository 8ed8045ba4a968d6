use ulid::Ulid;

use crate::model::*;

use super::cache::CatalogCache;
use super::conflict;
use super::{Engine, EngineError};

/// Whose bookings a listing is for. The caller must be that user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOwner {
    Provider(String),
    Client(String),
}

impl BookingOwner {
    pub fn id(&self) -> &str {
        match self {
            BookingOwner::Provider(id) | BookingOwner::Client(id) => id,
        }
    }

    pub fn user_type(&self) -> UserType {
        match self {
            BookingOwner::Provider(_) => UserType::Provider,
            BookingOwner::Client(_) => UserType::Client,
        }
    }

    /// The other participant of a booking, from this owner's side.
    fn counterpart<'b>(&self, booking: &'b Booking) -> &'b str {
        match self {
            BookingOwner::Provider(_) => &booking.client_id,
            BookingOwner::Client(_) => &booking.provider_id,
        }
    }
}

impl Engine {
    /// No authorization: any caller holding a booking id may read it.
    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let provider_id = self.index.provider_for(&id)?;
        let ledger = self.get_ledger(&provider_id)?;
        let guard = ledger.read().await;
        guard.get(id).cloned()
    }

    /// Active bookings of `provider_id` overlapping `span`.
    pub async fn find_conflicts(&self, provider_id: &str, span: &Span) -> Vec<Booking> {
        let Some(ledger) = self.get_ledger(provider_id) else {
            return Vec::new();
        };
        let guard = ledger.read().await;
        conflict::find_conflicts(&guard, span, None)
    }

    /// Every booking of a provider, ordered by start.
    pub async fn bookings_for_provider(&self, provider_id: &str) -> Vec<Booking> {
        let Some(ledger) = self.get_ledger(provider_id) else {
            return Vec::new();
        };
        let guard = ledger.read().await;
        guard.bookings.clone()
    }

    /// Every booking of a client, ordered by start.
    pub async fn bookings_for_client(&self, client_id: &str) -> Vec<Booking> {
        let mut found = Vec::new();
        for id in self.index.client_booking_ids(client_id) {
            if let Some(booking) = self.get_booking(id).await
                && booking.client_id == client_id
            {
                found.push(booking);
            }
        }
        found.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        found
    }

    /// Bookings of `owner` matching `filter`, joined with service, business
    /// and counterpart details, newest start first. Rows whose catalog
    /// references no longer resolve are skipped.
    pub async fn list_bookings(
        &self,
        claims: &Claims,
        owner: &BookingOwner,
        filter: &BookingFilter,
    ) -> Result<Vec<BookingWithDetails>, EngineError> {
        self.authorize_owner(claims, owner.id(), owner.user_type())
            .await?;

        let bookings = match owner {
            BookingOwner::Provider(id) => self.bookings_for_provider(id).await,
            BookingOwner::Client(id) => self.bookings_for_client(id).await,
        };

        let mut cache = CatalogCache::new(self.catalog.as_ref());
        let mut rows = Vec::new();
        for booking in bookings.into_iter().filter(|b| filter.matches(b)) {
            let Some(service) = cache.service(&booking.service_id).await? else {
                continue;
            };
            let Some(business) = cache.business(&service.business_id).await? else {
                continue;
            };
            let Some(person) = cache.profile(owner.counterpart(&booking)).await? else {
                continue;
            };
            rows.push(BookingWithDetails {
                service: ServiceDetails::from(&service),
                counterpart: PersonDetails::from(&person),
                business: BusinessDetails::from(&business),
                booking,
            });
        }
        rows.sort_by(|a, b| {
            b.booking
                .span
                .start
                .cmp(&a.booking.span.start)
                .then(b.booking.id.cmp(&a.booking.id))
        });
        Ok(rows)
    }

    /// The caller must be `owner_id`, and that profile must be of `expected` type.
    pub(super) async fn authorize_owner(
        &self,
        claims: &Claims,
        owner_id: &str,
        expected: UserType,
    ) -> Result<Profile, EngineError> {
        let actor = claims.current_user_id().ok_or(EngineError::Unauthenticated)?;
        let (field, noun) = match expected {
            UserType::Provider => ("provider_id", "provider"),
            UserType::Client => ("client_id", "client"),
        };
        if actor != owner_id {
            return Err(EngineError::Forbidden(format!(
                "You are not allowed to access this {noun}'s data."
            )));
        }
        let profile = self
            .catalog
            .get_profile(owner_id)
            .await?
            .ok_or_else(|| EngineError::not_found(noun, owner_id))?;
        if profile.user_type != expected {
            return Err(EngineError::validation(
                field,
                format!("User with ID '{owner_id}' is not a {noun}."),
            ));
        }
        Ok(profile)
    }
}
