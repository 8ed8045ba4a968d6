use chrono::{DateTime, TimeDelta, Utc};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::check_no_conflict;
use super::validate::{owns_resource, validate_window};
use super::{Engine, EngineError};

/// Resolve a requested status change. Re-stating the current status is a
/// no-op; anything else must follow the lifecycle.
pub fn transition(current: BookingStatus, requested: BookingStatus) -> Result<BookingStatus, EngineError> {
    if current == requested || current.can_transition_to(requested) {
        Ok(requested)
    } else {
        Err(EngineError::InvalidTransition {
            from: current,
            to: requested,
        })
    }
}

fn check_id_len(field: &'static str, id: &str) -> Result<(), EngineError> {
    if id.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded(field));
    }
    Ok(())
}

impl Engine {
    pub async fn create_booking(&self, claims: &Claims, cmd: CreateBooking) -> Result<Booking, EngineError> {
        self.create_booking_at(claims, cmd, Utc::now()).await
    }

    pub async fn create_booking_at(
        &self,
        claims: &Claims,
        cmd: CreateBooking,
        now: DateTime<Utc>,
    ) -> Result<Booking, EngineError> {
        let client_id = claims
            .current_user_id()
            .ok_or(EngineError::Unauthenticated)?
            .to_string();
        check_id_len("service id too long", &cmd.service_id)?;
        if let Some(key) = &cmd.idempotency_key {
            if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(EngineError::LimitExceeded("idempotency key too long"));
            }
            if let Some(existing) = self.keyed_booking(&client_id, key, &cmd.service_id).await? {
                return Ok(existing);
            }
        }

        let service = self
            .catalog
            .get_service(&cmd.service_id)
            .await?
            .ok_or_else(|| EngineError::not_found("service", &cmd.service_id))?;
        if !service.is_active {
            return Err(EngineError::validation(
                "service_id",
                "This service is not currently available for booking.",
            ));
        }
        let business = self
            .catalog
            .get_business(&service.business_id)
            .await?
            .ok_or_else(|| EngineError::not_found("business", &service.business_id))?;
        if !business.is_active {
            return Err(EngineError::validation(
                "service_id",
                "This business is not currently accepting bookings.",
            ));
        }
        if owns_resource(&client_id, &business.provider_id) {
            return Err(EngineError::BadRequest("You cannot book your own service.".into()));
        }

        let duration = TimeDelta::try_minutes(service.duration_minutes).ok_or_else(|| {
            EngineError::validation("service_id", "This service has an invalid duration.")
        })?;
        let end = cmd
            .start_time
            .checked_add_signed(duration)
            .ok_or_else(beyond_horizon)?;
        if let Some(requested_end) = cmd.end_time
            && (requested_end - end).abs() > self.policy.end_time_tolerance
        {
            return Err(EngineError::validation(
                "end_time",
                format!(
                    "End time must match the service duration of {} minutes.",
                    service.duration_minutes
                ),
            ));
        }
        let span = Span::new(cmd.start_time, end);
        validate_window(&span, now, &self.policy)?;

        let ledger = self.ledger_for(&business.provider_id);
        let guard = ledger.write_owned().await;

        // A retry may have committed while we waited for the lock.
        if let Some(key) = &cmd.idempotency_key
            && let Some(id) = self.index.lookup_key(&client_id, key)
        {
            return match guard.get(id) {
                Some(existing) if existing.service_id == cmd.service_id => Ok(existing.clone()),
                _ => Err(idempotency_mismatch()),
            };
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many bookings for provider"));
        }
        check_no_conflict(&guard, &span, None)?;

        let booking = Booking {
            id: Ulid::new(),
            service_id: service.id,
            client_id,
            provider_id: business.provider_id,
            span,
            status: BookingStatus::Pending,
            created_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
            idempotency_key: cmd.idempotency_key,
        };
        self.commit(guard, event).await?;

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            booking_id = %booking.id,
            provider_id = %booking.provider_id,
            start = %booking.span.start,
            "booking created"
        );
        Ok(booking)
    }

    /// Returns `Ok(None)` when no booking has this id.
    pub async fn update_booking(
        &self,
        claims: &Claims,
        cmd: UpdateBooking,
    ) -> Result<Option<Booking>, EngineError> {
        self.update_booking_at(claims, cmd, Utc::now()).await
    }

    pub async fn update_booking_at(
        &self,
        claims: &Claims,
        cmd: UpdateBooking,
        now: DateTime<Utc>,
    ) -> Result<Option<Booking>, EngineError> {
        let actor = claims.current_user_id().ok_or(EngineError::Unauthenticated)?;
        let Some(provider_id) = self.index.provider_for(&cmd.id) else {
            return Ok(None);
        };
        let Some(ledger) = self.get_ledger(&provider_id) else {
            return Ok(None);
        };
        let guard = ledger.write_owned().await;
        let Some(current) = guard.get(cmd.id).cloned() else {
            return Ok(None);
        };
        if !current.involves(actor) {
            return Err(EngineError::Forbidden(
                "You are not allowed to modify this booking.".into(),
            ));
        }

        let mut updated = current.clone();
        if let Some(requested) = cmd.status {
            updated.status = transition(current.status, requested)?;
            let provider_only = matches!(requested, BookingStatus::Confirmed | BookingStatus::Completed);
            if provider_only && requested != current.status && actor != current.provider_id {
                return Err(EngineError::Forbidden(format!(
                    "Only the provider can mark a booking {requested}."
                )));
            }
        }

        if cmd.reschedules() {
            let start = cmd.start_time.unwrap_or(current.span.start);
            let end = match cmd.end_time {
                Some(end) => end,
                None => start
                    .checked_add_signed(current.span.duration())
                    .ok_or_else(beyond_horizon)?,
            };
            let span = Span::new(start, end);
            if span != current.span {
                if current.status.is_terminal() {
                    return Err(EngineError::validation(
                        "start_time",
                        format!("A {} booking cannot be rescheduled.", current.status),
                    ));
                }
                validate_window(&span, now, &self.policy)?;
                if updated.is_active() {
                    check_no_conflict(&guard, &span, Some(current.id))?;
                }
                updated.span = span;
            }
        }

        if updated == current {
            return Ok(Some(current));
        }
        self.commit(guard, Event::BookingUpdated { booking: updated.clone() })
            .await?;
        info!(
            booking_id = %updated.id,
            status = %updated.status,
            "booking updated"
        );
        Ok(Some(updated))
    }

    /// Returns `Ok(false)` when no booking has this id.
    pub async fn delete_booking(&self, claims: &Claims, id: Ulid) -> Result<bool, EngineError> {
        let actor = claims.current_user_id().ok_or(EngineError::Unauthenticated)?;
        let Some(provider_id) = self.index.provider_for(&id) else {
            return Ok(false);
        };
        let Some(ledger) = self.get_ledger(&provider_id) else {
            return Ok(false);
        };
        let guard = ledger.write_owned().await;
        let Some(current) = guard.get(id) else {
            return Ok(false);
        };
        if !current.involves(actor) {
            return Err(EngineError::Forbidden(
                "You are not allowed to delete this booking.".into(),
            ));
        }
        self.commit(guard, Event::BookingDeleted { id, provider_id })
            .await?;
        info!(booking_id = %id, "booking deleted");
        Ok(true)
    }

    /// The booking a (client, key) pair already produced, if any.
    async fn keyed_booking(
        &self,
        client_id: &str,
        key: &str,
        service_id: &str,
    ) -> Result<Option<Booking>, EngineError> {
        let Some(id) = self.index.lookup_key(client_id, key) else {
            return Ok(None);
        };
        match self.get_booking(id).await {
            Some(existing) if existing.service_id == service_id => Ok(Some(existing)),
            Some(_) => Err(idempotency_mismatch()),
            None => Ok(None),
        }
    }
}

/// Raised when a requested start is too far out for its end to be computed.
fn beyond_horizon() -> EngineError {
    EngineError::validation("start_time", "Start time cannot be more than 1 year in the future.")
}

fn idempotency_mismatch() -> EngineError {
    EngineError::BadRequest("Idempotency key was already used for a different booking request.".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use BookingStatus::*;

    #[test]
    fn transition_follows_lifecycle() {
        assert_eq!(transition(Pending, Confirmed).unwrap(), Confirmed);
        assert_eq!(transition(Confirmed, Completed).unwrap(), Completed);
        assert_eq!(transition(Pending, Cancelled).unwrap(), Cancelled);
        assert_eq!(transition(Confirmed, Cancelled).unwrap(), Cancelled);
    }

    #[test]
    fn transition_same_status_is_noop() {
        for s in [Pending, Confirmed, Completed, Cancelled] {
            assert_eq!(transition(s, s).unwrap(), s);
        }
    }

    #[test]
    fn transition_rejects_skips_and_reversals() {
        for (from, to) in [
            (Pending, Completed),
            (Completed, Cancelled),
            (Completed, Pending),
            (Cancelled, Confirmed),
            (Confirmed, Pending),
        ] {
            match transition(from, to) {
                Err(EngineError::InvalidTransition { from: f, to: t }) => {
                    assert_eq!((f, t), (from, to));
                }
                other => panic!("expected InvalidTransition for {from}->{to}, got {other:?}"),
            }
        }
    }
}
