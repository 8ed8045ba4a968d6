mod cache;
mod conflict;
mod error;
mod mutations;
mod queries;
mod stats;
mod store;
pub mod validate;

pub use error::EngineError;
pub use mutations::transition;
pub use queries::BookingOwner;
pub use stats::CalendarWindows;
pub use store::LedgerIndex;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::info;

use crate::catalog::Catalog;
use crate::limits::BookingPolicy;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<ProviderLedger>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) struct WalAppend {
    event: Event,
    response: oneshot::Sender<io::Result<()>>,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalAppend>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());

        for append in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = append.response.send(r);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[WalAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for append in batch {
        if let Err(e) = wal.append_buffered(&append.event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

async fn wal_append(wal_tx: &mpsc::Sender<WalAppend>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalAppend {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::Internal(format!("WAL error: {e}")))
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub wal_path: PathBuf,
    pub policy: BookingPolicy,
    /// Rewrite the WAL on open once it carries this many events beyond the
    /// live bookings.
    pub compact_threshold: u64,
}

impl EngineOptions {
    pub fn new(wal_path: PathBuf) -> Self {
        Self {
            wal_path,
            policy: BookingPolicy::default(),
            compact_threshold: 1000,
        }
    }
}

/// The booking ledger plus the lifecycle and aggregation logic over it.
pub struct Engine {
    pub(super) ledgers: DashMap<String, SharedLedger>,
    pub(super) index: Arc<LedgerIndex>,
    pub(super) wal_tx: mpsc::Sender<WalAppend>,
    pub notify: Arc<NotifyHub>,
    pub(super) catalog: Arc<dyn Catalog>,
    pub(super) policy: BookingPolicy,
}

impl Engine {
    pub fn new(
        options: EngineOptions,
        catalog: Arc<dyn Catalog>,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&options.wal_path)?;
        let mut wal = Wal::open(&options.wal_path)?;

        // Sole owner during replay: build plain ledgers, wrap them afterwards.
        let index = Arc::new(LedgerIndex::new());
        let mut ledgers: HashMap<String, ProviderLedger> = HashMap::new();
        for event in &events {
            let provider_id = event.provider_id().to_string();
            let ledger = ledgers
                .entry(provider_id.clone())
                .or_insert_with(|| ProviderLedger::new(provider_id));
            index.apply_event(ledger, event);
        }

        let live = index.booking_count() as u64;
        let replayed = events.len() as u64;
        if replayed >= live + options.compact_threshold.max(1) {
            let snapshot = snapshot_events(&ledgers, &index);
            Wal::write_compact_file(wal.path(), &snapshot)?;
            wal.swap_compact_file()?;
            info!("compacted WAL: {replayed} events -> {}", snapshot.len());
        }

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let state = DashMap::new();
        for (provider_id, ledger) in ledgers {
            if !ledger.bookings.is_empty() {
                state.insert(provider_id, Arc::new(RwLock::new(ledger)));
            }
        }
        info!("booking ledger loaded: {live} bookings, {} providers", state.len());

        Ok(Self {
            ledgers: state,
            index,
            wal_tx,
            notify,
            catalog,
            policy: options.policy,
        })
    }

    pub fn get_ledger(&self, provider_id: &str) -> Option<SharedLedger> {
        self.ledgers.get(provider_id).map(|e| e.value().clone())
    }

    /// Get or lazily create the ledger for a provider.
    pub(super) fn ledger_for(&self, provider_id: &str) -> SharedLedger {
        if let Some(ledger) = self.get_ledger(provider_id) {
            return ledger;
        }
        self.ledgers
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ProviderLedger::new(provider_id.to_string()))))
            .value()
            .clone()
    }

    /// WAL-append + apply + notify while holding the provider's write lock.
    ///
    /// Runs in its own task that owns the guard: if the caller's future is
    /// dropped mid-commit, the commit still completes and memory never
    /// diverges from the log.
    pub(super) async fn commit(
        &self,
        mut guard: OwnedRwLockWriteGuard<ProviderLedger>,
        event: Event,
    ) -> Result<(), EngineError> {
        let wal_tx = self.wal_tx.clone();
        let index = self.index.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            wal_append(&wal_tx, &event).await?;
            index.apply_event(&mut guard, &event);
            notify.send(&event);
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("commit task failed: {e}")))?
    }
}

/// Minimal event list that recreates the given ledgers.
fn snapshot_events(ledgers: &HashMap<String, ProviderLedger>, index: &LedgerIndex) -> Vec<Event> {
    let mut provider_ids: Vec<&String> = ledgers.keys().collect();
    provider_ids.sort();
    let mut events = Vec::new();
    for pid in provider_ids {
        for booking in &ledgers[pid].bookings {
            events.push(Event::BookingCreated {
                booking: booking.clone(),
                idempotency_key: index.key_for(&booking.id),
            });
        }
    }
    events
}
