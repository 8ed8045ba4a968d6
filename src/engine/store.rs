use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Secondary indexes over the provider ledgers.
pub struct LedgerIndex {
    booking_to_provider: DashMap<Ulid, String>,
    client_bookings: DashMap<String, Vec<Ulid>>,
    /// (client id, idempotency key) → booking id
    idempotency: DashMap<(String, String), Ulid>,
    /// booking id → (client id, idempotency key), for cleanup on delete
    booking_keys: DashMap<Ulid, (String, String)>,
}

impl Default for LedgerIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerIndex {
    pub fn new() -> Self {
        Self {
            booking_to_provider: DashMap::new(),
            client_bookings: DashMap::new(),
            idempotency: DashMap::new(),
            booking_keys: DashMap::new(),
        }
    }

    // ── Booking → provider ───────────────────────────────────

    pub fn provider_for(&self, booking_id: &Ulid) -> Option<String> {
        self.booking_to_provider
            .get(booking_id)
            .map(|e| e.value().clone())
    }

    pub fn booking_count(&self) -> usize {
        self.booking_to_provider.len()
    }

    // ── Client index ─────────────────────────────────────────

    pub fn client_booking_ids(&self, client_id: &str) -> Vec<Ulid> {
        self.client_bookings
            .get(client_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Idempotency keys ─────────────────────────────────────

    pub fn lookup_key(&self, client_id: &str, key: &str) -> Option<Ulid> {
        self.idempotency
            .get(&(client_id.to_string(), key.to_string()))
            .map(|e| *e.value())
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to one provider's ledger and the indexes. Caller holds
    /// the ledger's write lock.
    pub fn apply_event(&self, ledger: &mut ProviderLedger, event: &Event) {
        match event {
            Event::BookingCreated {
                booking,
                idempotency_key,
            } => {
                ledger.insert_booking(booking.clone());
                self.booking_to_provider
                    .insert(booking.id, booking.provider_id.clone());
                self.client_bookings
                    .entry(booking.client_id.clone())
                    .or_default()
                    .push(booking.id);
                if let Some(key) = idempotency_key {
                    let pair = (booking.client_id.clone(), key.clone());
                    self.idempotency.insert(pair.clone(), booking.id);
                    self.booking_keys.insert(booking.id, pair);
                }
            }
            Event::BookingUpdated { booking } => {
                ledger.remove_booking(booking.id);
                ledger.insert_booking(booking.clone());
            }
            Event::BookingDeleted { id, .. } => {
                if let Some(removed) = ledger.remove_booking(*id)
                    && let Some(mut ids) = self.client_bookings.get_mut(&removed.client_id)
                {
                    ids.retain(|b| b != id);
                }
                self.booking_to_provider.remove(id);
                if let Some((_, pair)) = self.booking_keys.remove(id) {
                    self.idempotency.remove(&pair);
                }
            }
        }
    }

    /// The idempotency key a live booking was created with, if any.
    pub fn key_for(&self, booking_id: &Ulid) -> Option<String> {
        self.booking_keys
            .get(booking_id)
            .map(|e| e.value().1.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone, Utc};

    fn booking(client: &str) -> Booking {
        let start = Utc.with_ymd_and_hms(2030, 1, 7, 10, 0, 0).unwrap();
        Booking {
            id: Ulid::new(),
            service_id: "svc".into(),
            client_id: client.into(),
            provider_id: "prov".into(),
            span: Span::new(start, start + TimeDelta::hours(1)),
            status: BookingStatus::Pending,
            created_at: start,
        }
    }

    #[test]
    fn create_indexes_provider_client_and_key() {
        let index = LedgerIndex::new();
        let mut ledger = ProviderLedger::new("prov".into());
        let b = booking("c1");
        index.apply_event(
            &mut ledger,
            &Event::BookingCreated {
                booking: b.clone(),
                idempotency_key: Some("k1".into()),
            },
        );
        assert_eq!(index.provider_for(&b.id).as_deref(), Some("prov"));
        assert_eq!(index.client_booking_ids("c1"), vec![b.id]);
        assert_eq!(index.lookup_key("c1", "k1"), Some(b.id));
        assert_eq!(index.lookup_key("c2", "k1"), None);
        assert_eq!(index.key_for(&b.id).as_deref(), Some("k1"));
        assert_eq!(index.booking_count(), 1);
    }

    #[test]
    fn delete_clears_every_index() {
        let index = LedgerIndex::new();
        let mut ledger = ProviderLedger::new("prov".into());
        let b = booking("c1");
        index.apply_event(
            &mut ledger,
            &Event::BookingCreated {
                booking: b.clone(),
                idempotency_key: Some("k1".into()),
            },
        );
        index.apply_event(
            &mut ledger,
            &Event::BookingDeleted {
                id: b.id,
                provider_id: "prov".into(),
            },
        );
        assert!(ledger.bookings.is_empty());
        assert!(index.provider_for(&b.id).is_none());
        assert!(index.client_booking_ids("c1").is_empty());
        assert!(index.lookup_key("c1", "k1").is_none());
    }

    #[test]
    fn update_resorts_ledger() {
        let index = LedgerIndex::new();
        let mut ledger = ProviderLedger::new("prov".into());
        let first = booking("c1");
        let mut second = booking("c2");
        second.span = Span::new(
            first.span.start + TimeDelta::hours(3),
            first.span.end + TimeDelta::hours(3),
        );
        for b in [&first, &second] {
            index.apply_event(
                &mut ledger,
                &Event::BookingCreated {
                    booking: b.clone(),
                    idempotency_key: None,
                },
            );
        }
        let mut moved = first.clone();
        moved.span = Span::new(
            first.span.start + TimeDelta::hours(5),
            first.span.end + TimeDelta::hours(5),
        );
        index.apply_event(&mut ledger, &Event::BookingUpdated { booking: moved });
        assert_eq!(ledger.bookings[0].id, second.id);
        assert_eq!(ledger.bookings[1].id, first.id);
    }
}
