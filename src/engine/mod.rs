mod error;
mod queries;
mod txn;

pub use error::{CommitError, EngineError, TxnKey};
pub use txn::Transaction;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// A stored value plus the number of committed writes that touched it.
/// Absent keys read as version 0.
#[derive(Debug, Clone, Default)]
pub(crate) struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// All events of one transaction; they land in the same fsync.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    Shutdown {
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Make the next batch's fsync fail.
    #[cfg(test)]
    FailNextSync,
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch: Vec<PendingAppend> = Vec::new();
        let mut pending = Some(cmd);

        while let Some(cmd) = pending.take() {
            match cmd {
                WalCommand::Append { events, response } => {
                    batch.push((events, response));
                    // Keep draining while appends are queued.
                    pending = rx.try_recv().ok();
                }
                other => {
                    flush_and_respond(&mut wal, &mut batch);
                    if !handle_non_append(&mut wal, other) {
                        tracing::info!("WAL writer stopped");
                        return;
                    }
                }
            }
        }
        flush_and_respond(&mut wal, &mut batch);
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} transactions: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Write and sync a whole batch, or leave the log as it was before it.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                wal.discard_unsynced();
                return Err(e);
            }
        }
    }
    wal.flush_sync()
}

/// Returns false when the writer should stop.
fn handle_non_append(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
            true
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
            true
        }
        WalCommand::Shutdown { response } => {
            let _ = response.send(wal.flush_sync());
            false
        }
        #[cfg(test)]
        WalCommand::FailNextSync => {
            wal.fail_next_sync();
            true
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The transactional booking store.
///
/// Bookings live in `bookings`; `slots` indexes them by `(party, slot)` for
/// both parties of each booking. Writers only go through [`Transaction::commit`],
/// which validates the transaction's read set under per-key commit locks.
pub struct Engine {
    pub(super) bookings: DashMap<Ulid, Versioned<Option<Booking>>>,
    pub(super) slots: DashMap<SlotKey, Versioned<Vec<Ulid>>>,
    pub(super) ratings: DashMap<String, RatingTotals>,
    pub(super) live_bookings: AtomicUsize,
    commit_locks: DashMap<TxnKey, Arc<Mutex<()>>>,
    /// Commits hold this shared; compaction holds it exclusively.
    pub(super) checkpoint: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            bookings: DashMap::new(),
            slots: DashMap::new(),
            ratings: DashMap::new(),
            live_bookings: AtomicUsize::new(0),
            commit_locks: DashMap::new(),
            checkpoint: RwLock::new(()),
            wal_tx,
            notify,
        };
        // Replay: nobody else holds the engine yet, so apply without locks.
        for event in &events {
            engine.apply(event);
        }
        tracing::info!(
            "replayed {} WAL events from {}: {} live bookings",
            events.len(),
            wal_path.display(),
            engine.live_bookings()
        );
        Ok(engine)
    }

    /// Apply a committed event to in-memory state. The caller holds the
    /// commit locks of every key in `event_keys(event)`.
    ///
    /// Records are written before the index entries that point at them.
    fn apply(&self, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                {
                    let mut record = self.bookings.entry(booking.id).or_default();
                    record.version += 1;
                    if record.value.replace(booking.clone()).is_none() {
                        self.live_bookings.fetch_add(1, Ordering::Relaxed);
                    }
                }
                for key in booking.slot_keys() {
                    let mut entry = self.slots.entry(key).or_default();
                    if !entry.value.contains(&booking.id) {
                        entry.value.push(booking.id);
                    }
                    entry.version += 1;
                }
            }
            Event::BookingCancelled { id, client_id, provider_id, slot, .. } => {
                self.remove_booking(*id, client_id, provider_id, *slot);
            }
            Event::BookingRated { id, client_id, provider_id, slot, stars } => {
                self.remove_booking(*id, client_id, provider_id, *slot);
                let mut totals = self.ratings.entry(provider_id.clone()).or_default();
                totals.count += 1;
                totals.sum += u64::from(*stars);
            }
            Event::RatingsRestored { provider_id, totals } => {
                self.ratings.insert(provider_id.clone(), *totals);
            }
        }
    }

    fn remove_booking(&self, id: Ulid, client_id: &str, provider_id: &str, slot: Slot) {
        for party in [client_id, provider_id] {
            if let Some(mut entry) = self.slots.get_mut(&SlotKey::new(party, slot)) {
                entry.value.retain(|b| *b != id);
                entry.version += 1;
            }
        }
        let mut record = self.bookings.entry(id).or_default();
        record.version += 1;
        if record.value.take().is_some() {
            self.live_bookings.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub(super) fn current_version(&self, key: &TxnKey) -> u64 {
        match key {
            TxnKey::Slot(k) => self.slots.get(k).map_or(0, |e| e.version),
            TxnKey::Booking(id) => self.bookings.get(id).map_or(0, |e| e.version),
        }
    }

    pub(super) fn commit_lock(&self, key: &TxnKey) -> Arc<Mutex<()>> {
        self.commit_locks.entry(key.clone()).or_default().clone()
    }

    /// Drop commit locks nobody holds or waits on. Cloning a lock happens
    /// under the same shard lock as this check, so a lock in use stays.
    pub(super) fn release_commit_locks<'k>(&self, keys: impl IntoIterator<Item = &'k TxnKey>) {
        for key in keys {
            self.commit_locks
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    /// Forget closed booking records and empty index entries. Runs with
    /// commits paused. A pruned key reads as version 0, so a transaction that
    /// saw a booking live still fails validation, and one that saw an empty
    /// slot read exactly what is there now.
    fn prune_closed(&self) -> (usize, usize) {
        let (bookings, slots) = (self.bookings.len(), self.slots.len());
        self.bookings.retain(|_, record| record.value.is_some());
        self.slots.retain(|_, entry| !entry.value.is_empty());
        (bookings - self.bookings.len(), slots - self.slots.len())
    }

    /// Write events to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Commits wait while the snapshot is taken and written.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _paused = self.checkpoint.write().await;

        let (records, entries) = self.prune_closed();
        tracing::debug!("compaction pruned {records} closed bookings and {entries} empty slot entries");

        let mut live = self.all_bookings();
        live.sort_by_key(|b| b.id);
        let mut events: Vec<Event> = live
            .into_iter()
            .map(|booking| Event::BookingCreated { booking })
            .collect();
        let mut ratings: Vec<(String, RatingTotals)> = self
            .ratings
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        ratings.sort_by(|a, b| a.0.cmp(&b.0));
        events.extend(
            ratings
                .into_iter()
                .map(|(provider_id, totals)| Event::RatingsRestored { provider_id, totals }),
        );

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    #[cfg(test)]
    pub(super) async fn fail_next_wal_sync(&self) {
        let _ = self.wal_tx.send(WalCommand::FailNextSync).await;
    }

    /// Flush and stop the WAL writer. Commits after this fail with a WAL error.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Shutdown { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}

/// Keys an event writes. Commit locks these alongside the read set.
pub(super) fn event_keys(event: &Event) -> Vec<TxnKey> {
    match event {
        Event::BookingCreated { booking } => {
            let [client, provider] = booking.slot_keys();
            vec![
                TxnKey::Booking(booking.id),
                TxnKey::Slot(client),
                TxnKey::Slot(provider),
            ]
        }
        Event::BookingCancelled { id, client_id, provider_id, slot, .. }
        | Event::BookingRated { id, client_id, provider_id, slot, .. } => vec![
            TxnKey::Booking(*id),
            TxnKey::Slot(SlotKey::new(client_id, *slot)),
            TxnKey::Slot(SlotKey::new(provider_id, *slot)),
        ],
        // Rating totals are only ever incremented, never read inside a transaction.
        Event::RatingsRestored { .. } => Vec::new(),
    }
}
