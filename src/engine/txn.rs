use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{CommitError, Engine, EngineError, TxnKey, event_keys};

/// An optimistic read-then-write transaction against the booking store.
///
/// Reads see committed state and record the version they observed; writes
/// are staged and become visible only at [`commit`](Self::commit). Reads do
/// not see the transaction's own staged writes.
pub struct Transaction<'a> {
    engine: &'a Engine,
    reads: BTreeMap<TxnKey, u64>,
    writes: Vec<Event>,
}

impl<'a> Transaction<'a> {
    pub(super) fn new(engine: &'a Engine) -> Self {
        Self {
            engine,
            reads: BTreeMap::new(),
            writes: Vec::new(),
        }
    }

    /// Equality query on `(party, date, time)`: live bookings in which
    /// `party` is the client or the provider at `slot`.
    pub fn bookings_at(&mut self, party: &str, slot: Slot) -> Vec<Booking> {
        let key = SlotKey::new(party, slot);
        let (version, ids) = match self.engine.slots.get(&key) {
            Some(entry) => (entry.version, entry.value.clone()),
            None => (0, Vec::new()),
        };
        self.reads.entry(TxnKey::Slot(key)).or_insert(version);
        ids.iter()
            .filter_map(|id| self.engine.bookings.get(id).and_then(|r| r.value.clone()))
            .collect()
    }

    pub fn get_booking(&mut self, id: Ulid) -> Option<Booking> {
        let (version, booking) = match self.engine.bookings.get(&id) {
            Some(record) => (record.version, record.value.clone()),
            None => (0, None),
        };
        self.reads.entry(TxnKey::Booking(id)).or_insert(version);
        booking
    }

    pub fn create_booking(&mut self, booking: Booking) -> Result<(), EngineError> {
        self.stage(Event::BookingCreated { booking })
    }

    pub fn cancel_booking(&mut self, booking: &Booking, cancelled_by: &str) -> Result<(), EngineError> {
        self.stage(Event::BookingCancelled {
            id: booking.id,
            client_id: booking.client_id.clone(),
            provider_id: booking.provider_id.clone(),
            slot: booking.slot,
            cancelled_by: cancelled_by.to_string(),
        })
    }

    /// Close `booking` and add `stars` to its provider's rating totals.
    pub fn rate_booking(&mut self, booking: &Booking, stars: u8) -> Result<(), EngineError> {
        self.stage(Event::BookingRated {
            id: booking.id,
            client_id: booking.client_id.clone(),
            provider_id: booking.provider_id.clone(),
            slot: booking.slot,
            stars,
        })
    }

    fn stage(&mut self, event: Event) -> Result<(), EngineError> {
        if self.writes.len() >= MAX_TXN_WRITES {
            return Err(EngineError::LimitExceeded("too many writes in one transaction"));
        }
        self.writes.push(event);
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Validate the read set and, if nothing it read has changed, durably
    /// apply the staged writes. Returns the committed events.
    ///
    /// Locks on every read and written key are taken in key order, so two
    /// transactions touching a common key validate and apply one after the
    /// other; the later one sees the earlier one's version bump and aborts.
    pub async fn commit(self) -> Result<Vec<Event>, CommitError> {
        if self.writes.is_empty() {
            return Ok(Vec::new());
        }
        let _checkpoint = self.engine.checkpoint.read().await;

        let mut keys: BTreeSet<TxnKey> = self.reads.keys().cloned().collect();
        for event in &self.writes {
            keys.extend(event_keys(event));
        }
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self.engine.commit_lock(key);
            guards.push(lock.lock_owned().await);
        }

        let outcome = self.validate_and_write().await;
        drop(guards);
        self.engine.release_commit_locks(&keys);
        outcome.map(|()| self.writes)
    }

    /// The locked part of a commit. The caller holds every key's commit lock.
    async fn validate_and_write(&self) -> Result<(), CommitError> {
        for (key, seen) in &self.reads {
            let current = self.engine.current_version(key);
            if current != *seen {
                debug!("commit aborted: {key} at version {current}, read at {seen}");
                return Err(CommitError::Aborted { key: key.clone() });
            }
        }

        let creating = self
            .writes
            .iter()
            .filter(|e| matches!(e, Event::BookingCreated { .. }))
            .count();
        if creating > 0 && self.engine.live_bookings() + creating > MAX_LIVE_BOOKINGS {
            return Err(EngineError::LimitExceeded("too many live bookings").into());
        }

        self.engine.wal_append(&self.writes).await?;
        for event in &self.writes {
            self.engine.apply(event);
        }
        // Broadcast before releasing the locks so subscribers see per-key commit order.
        for event in &self.writes {
            self.engine.notify.send(event);
        }
        Ok(())
    }
}

impl Engine {
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Run `body` in a fresh transaction and commit it, retrying on aborted
    /// commits up to `max_attempts` times.
    ///
    /// An error from `body` ends the call at once: nothing is committed and
    /// nothing is retried. Exhausting the budget yields
    /// [`EngineError::Contention`].
    pub async fn run_transaction<T, E, F>(&self, max_attempts: u32, mut body: F) -> Result<T, E>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T, E>,
        E: From<EngineError>,
    {
        let max_attempts = max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let mut txn = self.begin();
            let out = body(&mut txn)?;
            match txn.commit().await {
                Ok(_) => return Ok(out),
                Err(CommitError::Aborted { key }) => {
                    debug!("transaction attempt {attempt}/{max_attempts} aborted on {key}");
                    metrics::counter!(crate::observability::TXN_ABORTS_TOTAL).increment(1);
                    tokio::task::yield_now().await;
                }
                Err(CommitError::Engine(e)) => return Err(e.into()),
            }
        }
        metrics::counter!(crate::observability::TXN_CONTENTION_TOTAL).increment(1);
        Err(EngineError::Contention { attempts: max_attempts }.into())
    }
}
