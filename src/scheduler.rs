use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::observability;

/// Detail keys that would shadow a structural field of the stored booking.
const RESERVED_DETAIL_KEYS: &[&str] = &[
    "id",
    "client_id",
    "clientId",
    "status",
    "created_at",
    "createdAt",
];

/// A booking request as the caller sends it. Everything other than the
/// three required fields is an opaque descriptive detail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BookingRequest {
    #[serde(default, alias = "providerId")]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(flatten)]
    pub details: BTreeMap<String, String>,
}

impl BookingRequest {
    /// Build a request from `(column, value)` pairs of an INSERT.
    /// NULL descriptive columns are dropped.
    pub fn from_columns(columns: Vec<(String, Option<String>)>) -> Self {
        let mut request = Self::default();
        for (column, value) in columns {
            match column.as_str() {
                "provider_id" | "providerid" | "providerId" => request.provider_id = value,
                "date" => request.date = value,
                "time" => request.time = value,
                _ => {
                    if let Some(v) = value {
                        request.details.insert(column, v);
                    }
                }
            }
        }
        request
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub id: Ulid,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotConflict {
    RequesterBusy,
    ProviderBusy,
}

impl SlotConflict {
    fn label(&self) -> &'static str {
        match self {
            SlotConflict::RequesterBusy => "requester_busy",
            SlotConflict::ProviderBusy => "provider_busy",
        }
    }
}

impl std::fmt::Display for SlotConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotConflict::RequesterBusy => {
                write!(f, "requester already has a booking at this date/time")
            }
            SlotConflict::ProviderBusy => write!(f, "provider already booked at this date/time"),
        }
    }
}

#[derive(Debug)]
pub enum SchedulerError {
    Unauthenticated,
    InvalidArgument(String),
    SlotConflict(SlotConflict),
    /// Store contention outlasted the transaction runner's budget. Safe to retry.
    Conflict { attempts: u32 },
    NotFound(Ulid),
    PermissionDenied(String),
    Internal(String),
}

impl SchedulerError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::Unauthenticated => "unauthenticated",
            SchedulerError::InvalidArgument(_) => "invalid_argument",
            SchedulerError::SlotConflict(_) => "slot_conflict",
            SchedulerError::Conflict { .. } => "conflict",
            SchedulerError::NotFound(_) => "not_found",
            SchedulerError::PermissionDenied(_) => "permission_denied",
            SchedulerError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::Unauthenticated => write!(f, "authentication required"),
            SchedulerError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            SchedulerError::SlotConflict(c) => write!(f, "{c}"),
            SchedulerError::Conflict { attempts } => write!(
                f,
                "booking store busy: transaction aborted after {attempts} attempts, retry"
            ),
            SchedulerError::NotFound(id) => write!(f, "booking not found: {id}"),
            SchedulerError::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            SchedulerError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<EngineError> for SchedulerError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Contention { attempts } => SchedulerError::Conflict { attempts },
            EngineError::NotFound(id) => SchedulerError::NotFound(id),
            EngineError::LimitExceeded(_) | EngineError::WalError(_) => {
                SchedulerError::Internal(e.to_string())
            }
        }
    }
}

/// Admits, cancels and rates bookings. Every operation is one store
/// transaction: its reads and its write commit together or not at all.
pub struct BookingScheduler {
    engine: Arc<Engine>,
    max_attempts: u32,
}

impl BookingScheduler {
    pub fn new(engine: Arc<Engine>, max_attempts: u32) -> Self {
        Self {
            engine,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Create a booking of `request.provider_id` by the requester, unless
    /// either party already has a booking at the requested slot.
    pub async fn create_booking(
        &self,
        requester: Option<&str>,
        request: BookingRequest,
    ) -> Result<BookingReceipt, SchedulerError> {
        let result = self.try_create_booking(requester, request).await;
        match &result {
            Ok(_) => metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1),
            Err(e) => record_rejection("create_booking", e),
        }
        result
    }

    async fn try_create_booking(
        &self,
        requester: Option<&str>,
        request: BookingRequest,
    ) -> Result<BookingReceipt, SchedulerError> {
        let client_id = authenticated(requester)?;
        let provider_id = required("provider_id", request.provider_id.as_deref())?;
        let date = required("date", request.date.as_deref())?;
        let time = required("time", request.time.as_deref())?;
        check_party_id("provider_id", provider_id)?;
        if provider_id == client_id {
            return Err(SchedulerError::InvalidArgument(
                "cannot book yourself".into(),
            ));
        }
        let slot =
            Slot::parse(date, time).map_err(|e| SchedulerError::InvalidArgument(e.to_string()))?;
        check_details(&request.details)?;

        let id = self
            .engine
            .run_transaction(self.max_attempts, |txn| {
                if !txn.bookings_at(client_id, slot).is_empty() {
                    return Err(SchedulerError::SlotConflict(SlotConflict::RequesterBusy));
                }
                if !txn.bookings_at(provider_id, slot).is_empty() {
                    return Err(SchedulerError::SlotConflict(SlotConflict::ProviderBusy));
                }
                let booking = Booking {
                    id: Ulid::new(),
                    client_id: client_id.to_string(),
                    provider_id: provider_id.to_string(),
                    slot,
                    status: BookingStatus::Pending,
                    created_at: now_ms(),
                    details: request.details.clone(),
                };
                let id = booking.id;
                txn.create_booking(booking)?;
                Ok(id)
            })
            .await?;

        info!("booking {id} created: {client_id} with {provider_id} at {slot}");
        Ok(BookingReceipt {
            id,
            success: true,
            message: "Booking created successfully".into(),
        })
    }

    /// Remove a booking. Either party may cancel; the slot frees up for both.
    pub async fn cancel_booking(
        &self,
        requester: Option<&str>,
        booking_id: Ulid,
    ) -> Result<Booking, SchedulerError> {
        let result: Result<Booking, SchedulerError> = async {
            let party = authenticated(requester)?;
            self.engine
                .run_transaction(self.max_attempts, |txn| {
                    let booking = txn
                        .get_booking(booking_id)
                        .ok_or(SchedulerError::NotFound(booking_id))?;
                    if !booking.involves(party) {
                        return Err(SchedulerError::PermissionDenied(
                            "only the client or the provider may cancel a booking".into(),
                        ));
                    }
                    txn.cancel_booking(&booking, party)?;
                    Ok(booking)
                })
                .await
        }
        .await;

        match &result {
            Ok(b) => {
                info!("booking {booking_id} cancelled by {}", requester.unwrap_or_default());
                metrics::counter!(observability::BOOKINGS_CLOSED_TOTAL, "reason" => "cancelled")
                    .increment(1);
                debug!("slot {} released for {} and {}", b.slot, b.client_id, b.provider_id);
            }
            Err(e) => record_rejection("cancel_booking", e),
        }
        result
    }

    /// Rate the provider of a booking and close it. Only the client rates,
    /// and a booking can be rated once.
    pub async fn rate_booking(
        &self,
        requester: Option<&str>,
        booking_id: Ulid,
        stars: i64,
    ) -> Result<ProviderRating, SchedulerError> {
        let result: Result<ProviderRating, SchedulerError> = async {
            let client = authenticated(requester)?;
            if stars < i64::from(MIN_STARS) || stars > i64::from(MAX_STARS) {
                return Err(SchedulerError::InvalidArgument(format!(
                    "stars must be between {MIN_STARS} and {MAX_STARS}, got {stars}"
                )));
            }
            let stars = stars as u8;
            let booking = self
                .engine
                .run_transaction(self.max_attempts, |txn| {
                    let booking = txn
                        .get_booking(booking_id)
                        .ok_or(SchedulerError::NotFound(booking_id))?;
                    if booking.client_id != client {
                        return Err(SchedulerError::PermissionDenied(
                            "only the booking's client may rate it".into(),
                        ));
                    }
                    txn.rate_booking(&booking, stars)?;
                    Ok(booking)
                })
                .await?;
            info!("booking {booking_id} rated {stars} by {client}");
            Ok(self.engine.provider_rating(&booking.provider_id))
        }
        .await;

        match &result {
            Ok(_) => metrics::counter!(observability::BOOKINGS_CLOSED_TOTAL, "reason" => "rated")
                .increment(1),
            Err(e) => record_rejection("rate_booking", e),
        }
        result
    }

    pub fn provider_rating(&self, provider_id: &str) -> Result<ProviderRating, SchedulerError> {
        let provider_id = required("provider_id", Some(provider_id))?;
        check_party_id("provider_id", provider_id)?;
        Ok(self.engine.provider_rating(provider_id))
    }
}

fn record_rejection(operation: &'static str, e: &SchedulerError) {
    let reason = match e {
        SchedulerError::SlotConflict(c) => c.label(),
        other => other.kind(),
    };
    metrics::counter!(
        observability::BOOKING_REJECTIONS_TOTAL,
        "operation" => operation,
        "reason" => reason
    )
    .increment(1);
    match e {
        SchedulerError::Internal(msg) => error!("{operation} failed: {msg}"),
        SchedulerError::Conflict { attempts } => {
            info!("{operation} gave up after {attempts} contended attempts")
        }
        other => debug!("{operation} rejected: {other}"),
    }
}

fn authenticated(requester: Option<&str>) -> Result<&str, SchedulerError> {
    let id = requester
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(SchedulerError::Unauthenticated)?;
    if id.len() > MAX_PARTY_ID_LEN {
        return Err(SchedulerError::Unauthenticated);
    }
    Ok(id)
}

fn required<'a>(field: &str, value: Option<&'a str>) -> Result<&'a str, SchedulerError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SchedulerError::InvalidArgument(format!("{field} is required")))
}

fn check_party_id(field: &str, id: &str) -> Result<(), SchedulerError> {
    if id.len() > MAX_PARTY_ID_LEN {
        return Err(SchedulerError::InvalidArgument(format!(
            "{field} longer than {MAX_PARTY_ID_LEN} bytes"
        )));
    }
    Ok(())
}

fn check_details(details: &BTreeMap<String, String>) -> Result<(), SchedulerError> {
    if details.len() > MAX_DETAIL_FIELDS {
        return Err(SchedulerError::InvalidArgument(format!(
            "at most {MAX_DETAIL_FIELDS} descriptive fields"
        )));
    }
    for (key, value) in details {
        if RESERVED_DETAIL_KEYS.contains(&key.as_str()) {
            return Err(SchedulerError::InvalidArgument(format!(
                "{key} is assigned by the server"
            )));
        }
        if key.is_empty() || key.len() > MAX_DETAIL_KEY_LEN {
            return Err(SchedulerError::InvalidArgument(format!(
                "descriptive field name must be 1..={MAX_DETAIL_KEY_LEN} bytes"
            )));
        }
        if value.len() > MAX_DETAIL_VALUE_LEN {
            return Err(SchedulerError::InvalidArgument(format!(
                "{key} longer than {MAX_DETAIL_VALUE_LEN} bytes"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use tokio_test::{assert_err, assert_ok};

    use crate::notify::NotifyHub;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("cleanup_test_scheduler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn scheduler(name: &str) -> BookingScheduler {
        let engine = Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap();
        BookingScheduler::new(Arc::new(engine), DEFAULT_TXN_ATTEMPTS)
    }

    fn request(provider: &str, date: &str, time: &str) -> BookingRequest {
        BookingRequest {
            provider_id: Some(provider.into()),
            date: Some(date.into()),
            time: Some(time.into()),
            details: BTreeMap::new(),
        }
    }

    fn is_slot_conflict<T: std::fmt::Debug>(
        r: &Result<T, SchedulerError>,
        which: SlotConflict,
    ) -> bool {
        matches!(r, Err(SchedulerError::SlotConflict(c)) if *c == which)
    }

    #[tokio::test]
    async fn booking_scenario() {
        let s = scheduler("scenario.wal");

        let first = assert_ok!(s.create_booking(Some("c1"), request("p1", "2025-11-01", "09:00")).await);
        assert!(first.success);
        assert_eq!(first.message, "Booking created successfully");

        let r = s.create_booking(Some("c2"), request("p1", "2025-11-01", "09:00")).await;
        assert!(is_slot_conflict(&r, SlotConflict::ProviderBusy));

        let r = s.create_booking(Some("c1"), request("p2", "2025-11-01", "09:00")).await;
        assert!(is_slot_conflict(&r, SlotConflict::RequesterBusy));

        assert_ok!(s.create_booking(Some("c1"), request("p2", "2025-11-01", "10:00")).await);
        assert_eq!(s.engine().live_bookings(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_for_one_provider_slot_admit_one() {
        let s = Arc::new(scheduler("p1_provider.wal"));
        let n = 50;
        let mut handles = Vec::new();
        for i in 0..n {
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                s.create_booking(Some(&format!("client{i}")), request("p1", "2025-11-01", "09:00"))
                    .await
            }));
        }

        let mut ok = 0;
        for h in handles {
            let r = h.await.unwrap();
            if r.is_ok() {
                ok += 1;
            } else {
                assert!(is_slot_conflict(&r, SlotConflict::ProviderBusy), "{r:?}");
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(s.engine().live_bookings(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_by_one_client_admit_one() {
        let s = Arc::new(scheduler("p1_client.wal"));
        let n = 30;
        let mut handles = Vec::new();
        for i in 0..n {
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                s.create_booking(Some("c1"), request(&format!("provider{i}"), "2025-11-01", "09:00"))
                    .await
            }));
        }

        let mut ok = 0;
        for h in handles {
            let r = h.await.unwrap();
            if r.is_ok() {
                ok += 1;
            } else {
                assert!(is_slot_conflict(&r, SlotConflict::RequesterBusy), "{r:?}");
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn party_in_both_roles_is_booked_once() {
        // "x" is the client in half the requests and the provider in the other half.
        let s = Arc::new(scheduler("p1_mixed.wal"));
        let mut handles = Vec::new();
        for i in 0..20 {
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    s.create_booking(Some("x"), request(&format!("p{i}"), "2025-11-01", "09:00"))
                        .await
                } else {
                    s.create_booking(Some(&format!("c{i}")), request("x", "2025-11-01", "09:00"))
                        .await
                }
            }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(SchedulerError::SlotConflict(_)) => {}
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn disjoint_parties_share_a_slot() {
        let s = scheduler("p2.wal");
        assert_ok!(
            s.create_booking(Some("clientA"), request("providerX", "2025-10-20", "14:00"))
                .await
        );
        assert_ok!(
            s.create_booking(Some("clientB"), request("providerY", "2025-10-20", "14:00"))
                .await
        );
    }

    #[tokio::test]
    async fn existing_booking_blocks_both_parties() {
        let s = scheduler("p3.wal");
        assert_ok!(
            s.create_booking(Some("clientA"), request("providerX", "2025-10-20", "14:00"))
                .await
        );
        for provider in ["providerY", "providerZ"] {
            let r = s
                .create_booking(Some("clientA"), request(provider, "2025-10-20", "14:00"))
                .await;
            assert!(is_slot_conflict(&r, SlotConflict::RequesterBusy));
        }
        for client in ["clientB", "clientC"] {
            let r = s
                .create_booking(Some(client), request("providerX", "2025-10-20", "14:00"))
                .await;
            assert!(is_slot_conflict(&r, SlotConflict::ProviderBusy));
        }
        // Same slot spelled differently is still the same slot.
        let r = s
            .create_booking(Some("clientB"), request("providerX", "2025-10-20", "14:00 "))
            .await;
        assert!(is_slot_conflict(&r, SlotConflict::ProviderBusy));
        assert_eq!(s.engine().live_bookings(), 1);
    }

    #[tokio::test]
    async fn missing_fields_and_identity_are_rejected() {
        let s = scheduler("p5.wal");
        let mut no_provider = request("p1", "2025-11-01", "09:00");
        no_provider.provider_id = None;
        let mut empty_date = request("p1", "2025-11-01", "09:00");
        empty_date.date = Some(String::new());
        let mut blank_time = request("p1", "2025-11-01", "09:00");
        blank_time.time = Some("   ".into());

        for bad in [no_provider, empty_date, blank_time] {
            let r = s.create_booking(Some("c1"), bad).await;
            assert!(matches!(r, Err(SchedulerError::InvalidArgument(_))), "{r:?}");
        }
        for identity in [None, Some(""), Some("  ")] {
            let r = s
                .create_booking(identity, request("p1", "2025-11-01", "09:00"))
                .await;
            assert!(matches!(r, Err(SchedulerError::Unauthenticated)));
        }
        assert_eq!(s.engine().live_bookings(), 0);
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected() {
        let s = scheduler("malformed.wal");
        let cases = [
            request("p1", "01/11/2025", "09:00"),
            request("p1", "2025-02-30", "09:00"),
            request("p1", "2025-11-01", "9am"),
            request("c1", "2025-11-01", "09:00"),
        ];
        for bad in cases {
            let r = s.create_booking(Some("c1"), bad).await;
            assert!(matches!(r, Err(SchedulerError::InvalidArgument(_))), "{r:?}");
        }

        let mut shadowing = request("p1", "2025-11-01", "09:00");
        shadowing.details.insert("status".into(), "confirmed".into());
        let r = s.create_booking(Some("c1"), shadowing).await;
        assert!(matches!(r, Err(SchedulerError::InvalidArgument(_))));

        let mut crowded = request("p1", "2025-11-01", "09:00");
        for i in 0..=MAX_DETAIL_FIELDS {
            crowded.details.insert(format!("field{i}"), "v".into());
        }
        assert_err!(s.create_booking(Some("c1"), crowded).await);
        assert_eq!(s.engine().live_bookings(), 0);
    }

    #[tokio::test]
    async fn descriptive_fields_are_stored_verbatim() {
        let s = scheduler("details.wal");
        let req: BookingRequest = serde_json::from_str(
            r#"{
                "providerId": "p1",
                "date": "2025-11-01",
                "time": "09:00",
                "providerName": "Maria Fernandes",
                "clientAvatar": "https://img.example/c1.png"
            }"#,
        )
        .unwrap();
        assert_eq!(req.provider_id.as_deref(), Some("p1"));

        let receipt = assert_ok!(s.create_booking(Some("c1"), req).await);
        let stored = s.engine().get_booking(&receipt.id).unwrap();
        assert_eq!(stored.client_id, "c1");
        assert_eq!(stored.status, BookingStatus::Pending);
        assert_eq!(stored.details.len(), 2);
        assert_eq!(stored.details["providerName"], "Maria Fernandes");
        assert_eq!(stored.details["clientAvatar"], "https://img.example/c1.png");
    }

    #[test]
    fn request_from_insert_columns() {
        let req = BookingRequest::from_columns(vec![
            ("provider_id".into(), Some("p1".into())),
            ("date".into(), Some("2025-11-01".into())),
            ("time".into(), Some("09:00".into())),
            ("provider_name".into(), Some("Maria".into())),
            ("client_avatar".into(), None),
        ]);
        assert_eq!(req.provider_id.as_deref(), Some("p1"));
        assert_eq!(req.date.as_deref(), Some("2025-11-01"));
        assert_eq!(req.time.as_deref(), Some("09:00"));
        assert_eq!(req.details.len(), 1);
        assert_eq!(req.details["provider_name"], "Maria");
    }

    #[tokio::test]
    async fn failed_commit_creates_nothing() {
        let s = scheduler("p4.wal");
        s.engine().shutdown().await.unwrap();
        let r = s
            .create_booking(Some("c1"), request("p1", "2025-11-01", "09:00"))
            .await;
        assert!(matches!(r, Err(SchedulerError::Internal(_))));
        assert_eq!(s.engine().live_bookings(), 0);
        assert!(s.engine().all_bookings().is_empty());
    }

    #[test]
    fn contention_surfaces_as_conflict() {
        let e = SchedulerError::from(EngineError::Contention { attempts: 5 });
        assert!(matches!(e, SchedulerError::Conflict { attempts: 5 }));
        assert_eq!(e.kind(), "conflict");
    }

    #[tokio::test]
    async fn cancel_releases_slot() {
        let s = scheduler("cancel.wal");
        let receipt = assert_ok!(
            s.create_booking(Some("c1"), request("p1", "2025-11-01", "09:00"))
                .await
        );

        let r = s.cancel_booking(Some("stranger"), receipt.id).await;
        assert!(matches!(r, Err(SchedulerError::PermissionDenied(_))));
        assert!(matches!(
            s.cancel_booking(None, receipt.id).await,
            Err(SchedulerError::Unauthenticated)
        ));

        let cancelled = assert_ok!(s.cancel_booking(Some("p1"), receipt.id).await);
        assert_eq!(cancelled.id, receipt.id);
        assert!(matches!(
            s.cancel_booking(Some("p1"), receipt.id).await,
            Err(SchedulerError::NotFound(_))
        ));

        // Both parties are free again at that slot.
        assert_ok!(
            s.create_booking(Some("c1"), request("p2", "2025-11-01", "09:00"))
                .await
        );
        assert_ok!(
            s.create_booking(Some("c3"), request("p1", "2025-11-01", "09:00"))
                .await
        );
    }

    #[tokio::test]
    async fn rating_accumulates_and_closes_booking() {
        let s = scheduler("rating.wal");
        let a = assert_ok!(
            s.create_booking(Some("c1"), request("p1", "2025-11-01", "09:00"))
                .await
        );
        let b = assert_ok!(
            s.create_booking(Some("c2"), request("p1", "2025-11-01", "10:00"))
                .await
        );

        for stars in [0, 6, -1] {
            assert!(matches!(
                s.rate_booking(Some("c1"), a.id, stars).await,
                Err(SchedulerError::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            s.rate_booking(Some("p1"), a.id, 5).await,
            Err(SchedulerError::PermissionDenied(_))
        ));

        let after_a = assert_ok!(s.rate_booking(Some("c1"), a.id, 5).await);
        assert_eq!((after_a.count, after_a.sum), (1, 5));
        let after_b = assert_ok!(s.rate_booking(Some("c2"), b.id, 4).await);
        assert_eq!(after_b.average, 4.5);

        assert!(matches!(
            s.rate_booking(Some("c1"), a.id, 5).await,
            Err(SchedulerError::NotFound(_))
        ));
        assert_eq!(s.engine().live_bookings(), 0);

        let rating = assert_ok!(s.provider_rating("p1"));
        assert_eq!(rating.count, 2);
        assert!(s.provider_rating(" ").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ratings_count_once() {
        let s = Arc::new(scheduler("p8.wal"));
        let receipt = assert_ok!(
            s.create_booking(Some("c1"), request("p1", "2025-11-01", "09:00"))
                .await
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = s.clone();
            let id = receipt.id;
            handles.push(tokio::spawn(async move {
                s.rate_booking(Some("c1"), id, 5).await
            }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(SchedulerError::NotFound(_)) => {}
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(s.engine().provider_rating("p1").count, 1);
    }
}
