use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for server-assigned timestamps.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// One bookable instant: a calendar date plus a time of day.
///
/// A slot is a point, not an interval. Two bookings on the same day at
/// different times never conflict, whatever the length of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl Slot {
    /// Parse an ISO `YYYY-MM-DD` date and an `HH:MM` time.
    /// Stored canonically, so `9:00` and `09:00` name the same slot.
    pub fn parse(date: &str, time: &str) -> Result<Self, SlotParseError> {
        let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
            .map_err(|e| SlotParseError::Date(format!("{date:?}: {e}")))?;
        let time = NaiveTime::parse_from_str(time.trim(), "%H:%M")
            .map_err(|e| SlotParseError::Time(format!("{time:?}: {e}")))?;
        Ok(Self { date, time })
    }

    pub fn date_string(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    pub fn time_string(&self) -> String {
        self.time.format("%H:%M").to_string()
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.date_string(), self.time_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotParseError {
    Date(String),
    Time(String),
}

impl std::fmt::Display for SlotParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotParseError::Date(e) => write!(f, "date must be YYYY-MM-DD, got {e}"),
            SlotParseError::Time(e) => write!(f, "time must be HH:MM, got {e}"),
        }
    }
}

impl std::error::Error for SlotParseError {}

/// The only status the scheduler assigns. Cancelled and rated bookings
/// leave the store instead of changing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub client_id: String,
    pub provider_id: String,
    pub slot: Slot,
    pub status: BookingStatus,
    pub created_at: Ms,
    /// Caller-supplied descriptive fields (names, avatar URLs), stored verbatim.
    pub details: BTreeMap<String, String>,
}

impl Booking {
    pub fn involves(&self, party: &str) -> bool {
        self.client_id == party || self.provider_id == party
    }

    /// Index keys this booking occupies: one per party.
    pub fn slot_keys(&self) -> [SlotKey; 2] {
        [
            SlotKey::new(&self.client_id, self.slot),
            SlotKey::new(&self.provider_id, self.slot),
        ]
    }
}

/// Index key of the slot table: a party (in either role) at one slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub party: String,
    pub slot: Slot,
}

impl SlotKey {
    pub fn new(party: &str, slot: Slot) -> Self {
        Self {
            party: party.to_string(),
            slot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Provider,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Provider => "provider",
        }
    }
}

/// Accumulated ratings of one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingTotals {
    pub count: u64,
    pub sum: u64,
}

impl RatingTotals {
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

/// The event types. This is the WAL record format and the payload of the
/// committed-event broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        client_id: String,
        provider_id: String,
        slot: Slot,
        cancelled_by: String,
    },
    BookingRated {
        id: Ulid,
        client_id: String,
        provider_id: String,
        slot: Slot,
        stars: u8,
    },
    /// Written by compaction only: carries a provider's totals forward.
    RatingsRestored {
        provider_id: String,
        totals: RatingTotals,
    },
}

// ── Query result types ───────────────────────────────────────────

/// One line of a party's schedule, as the read model serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub booking_id: Ulid,
    pub role: Role,
    pub counterpart_id: String,
    pub slot: Slot,
    pub status: BookingStatus,
    pub details: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRating {
    pub provider_id: String,
    pub count: u64,
    pub sum: u64,
    pub average: f64,
}
