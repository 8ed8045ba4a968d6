use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Active bookings on `ledger` that overlap `span`, skipping `exclude`
/// (the booking being rescheduled).
pub(crate) fn find_conflicts(ledger: &ProviderLedger, span: &Span, exclude: Option<Ulid>) -> Vec<Booking> {
    ledger
        .overlapping(span)
        .filter(|b| b.is_active() && Some(b.id) != exclude)
        .filter(|b| b.span.overlaps(span))
        .cloned()
        .collect()
}

pub(crate) fn check_no_conflict(
    ledger: &ProviderLedger,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let conflicts = find_conflicts(ledger, span, exclude);
    if conflicts.is_empty() {
        return Ok(());
    }
    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
    tracing::debug!(
        provider_id = %ledger.provider_id,
        conflicting = %conflicts[0].id,
        "slot unavailable"
    );
    Err(EngineError::validation(
        "start_time",
        "Provider already has a booking during the requested time slot.",
    ))
}
