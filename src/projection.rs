use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use ulid::Ulid;

use crate::engine::Engine;
use crate::model::*;

/// Per-party schedules, mirrored from committed store events.
///
/// Eventually consistent: it trails the store by whatever is still queued
/// on the event broadcast. It never checks or rejects anything; the store
/// has already decided.
#[derive(Default)]
pub struct ScheduleProjection {
    schedules: DashMap<String, BTreeMap<(Slot, Ulid), ScheduleEntry>>,
}

impl ScheduleProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror one committed event. Applying an event twice is harmless.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::BookingCreated { booking } => self.insert(booking),
            Event::BookingCancelled {
                id,
                client_id,
                provider_id,
                slot,
                ..
            }
            | Event::BookingRated {
                id,
                client_id,
                provider_id,
                slot,
                ..
            } => {
                for party in [client_id, provider_id] {
                    self.remove(party, *slot, *id);
                }
            }
            Event::RatingsRestored { .. } => {}
        }
    }

    fn insert(&self, booking: &Booking) {
        let sides = [
            (&booking.client_id, Role::Client, &booking.provider_id),
            (&booking.provider_id, Role::Provider, &booking.client_id),
        ];
        for (party, role, counterpart) in sides {
            self.schedules.entry(party.clone()).or_default().insert(
                (booking.slot, booking.id),
                ScheduleEntry {
                    booking_id: booking.id,
                    role,
                    counterpart_id: counterpart.clone(),
                    slot: booking.slot,
                    status: booking.status,
                    details: booking.details.clone(),
                },
            );
        }
    }

    fn remove(&self, party: &str, slot: Slot, id: Ulid) {
        if let Some(mut entries) = self.schedules.get_mut(party) {
            entries.remove(&(slot, id));
        }
        self.schedules.remove_if(party, |_, entries| entries.is_empty());
    }

    /// Replace everything with a snapshot of live bookings.
    pub fn rebuild(&self, bookings: Vec<Booking>) {
        self.schedules.clear();
        for booking in &bookings {
            self.insert(booking);
        }
    }

    /// The party's bookings in either role, earliest slot first.
    pub fn schedule_for(&self, party: &str) -> Vec<ScheduleEntry> {
        self.schedules
            .get(party)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn party_count(&self) -> usize {
        self.schedules.len()
    }
}

/// Keep `projection` in step with `engine` until the engine's broadcast closes.
pub async fn run_projection(engine: Arc<Engine>, projection: Arc<ScheduleProjection>) {
    // Subscribe before the snapshot so nothing committed in between is missed.
    let rx = engine.notify.subscribe();
    projection.rebuild(engine.all_bookings());
    info!("schedule projection built for {} parties", projection.party_count());
    follow(engine, projection, rx).await;
}

async fn follow(
    engine: Arc<Engine>,
    projection: Arc<ScheduleProjection>,
    mut rx: broadcast::Receiver<Event>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => projection.apply(&event),
            Err(RecvError::Lagged(missed)) => {
                warn!("schedule projection missed {missed} events, rebuilding");
                metrics::counter!(crate::observability::PROJECTION_REBUILDS_TOTAL).increment(1);
                projection.rebuild(engine.all_bookings());
            }
            Err(RecvError::Closed) => return,
        }
    }
}
