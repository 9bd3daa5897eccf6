use std::sync::atomic::Ordering;

use ulid::Ulid;

use crate::model::*;

use super::Engine;

impl Engine {
    /// Committed state of one booking, outside any transaction.
    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).and_then(|r| r.value.clone())
    }

    /// Every live booking. Not a point-in-time snapshot while commits are running;
    /// read-model rebuilds reconcile with the event stream afterwards.
    pub fn all_bookings(&self) -> Vec<Booking> {
        self.bookings
            .iter()
            .filter_map(|r| r.value().value.clone())
            .collect()
    }

    pub fn live_bookings(&self) -> usize {
        self.live_bookings.load(Ordering::Relaxed)
    }

    pub fn provider_rating(&self, provider_id: &str) -> ProviderRating {
        let totals = self
            .ratings
            .get(provider_id)
            .map(|t| *t.value())
            .unwrap_or_default();
        ProviderRating {
            provider_id: provider_id.to_string(),
            count: totals.count,
            sum: totals.sum,
            average: totals.average(),
        }
    }
}
