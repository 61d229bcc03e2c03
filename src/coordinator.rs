use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use ulid::Ulid;

use crate::ledger::{Ledger, LedgerError};
use crate::lock::{LockError, LockManager};
use crate::model::{now_ms, LedgerAction, Ms, SlotEvent, SlotKey};
use crate::notify::RoomHub;

// ── Collaborator seams ───────────────────────────────────────────

/// Appointment fact produced by a confirmed booking. Owned by the
/// persistence collaborator; its existence is gated by the lock manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub slot: SlotKey,
    pub patient_id: String,
    pub details: BookingDetails,
    pub confirmed_at: Ms,
    pub status: AppointmentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppointmentStatus {
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDetails {
    #[serde(default)]
    pub consent: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug)]
pub struct PersistError(pub String);

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "persistence error: {}", self.0)
    }
}

impl std::error::Error for PersistError {}

/// Durable appointment storage — an external collaborator behind a narrow
/// interface.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn persist(&self, appointment: &Appointment) -> Result<(), PersistError>;
    async fn cancel(&self, booking_id: &Ulid) -> Result<(), PersistError>;
    async fn fetch(&self, booking_id: &Ulid) -> Result<Option<Appointment>, PersistError>;
}

#[derive(Debug)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification error: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Outbound patient notification (email/SMS/push) — fire-and-forget; a
/// failure never rolls back a booking.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &SlotEvent) -> Result<(), NotifyError>;
}

/// In-memory persistence standing in for the external appointment store.
pub struct MemoryPersistence {
    appointments: DashMap<Ulid, Appointment>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            appointments: DashMap::new(),
        }
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn persist(&self, appointment: &Appointment) -> Result<(), PersistError> {
        self.appointments
            .insert(appointment.id, appointment.clone());
        Ok(())
    }

    async fn cancel(&self, booking_id: &Ulid) -> Result<(), PersistError> {
        if let Some(mut appt) = self.appointments.get_mut(booking_id) {
            appt.status = AppointmentStatus::Cancelled;
        }
        Ok(())
    }

    async fn fetch(&self, booking_id: &Ulid) -> Result<Option<Appointment>, PersistError> {
        Ok(self.appointments.get(booking_id).map(|a| a.clone()))
    }
}

/// Notifier that only logs — delivery belongs to an external service.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &SlotEvent) -> Result<(), NotifyError> {
        info!(?event, "notification dispatched");
        Ok(())
    }
}

// ── Booking flow ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookRequest {
    pub resource_id: String,
    pub date: String,
    pub time: String,
    pub patient_id: String,
    #[serde(default)]
    pub details: BookingDetails,
}

impl BookRequest {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(
            self.resource_id.clone(),
            self.date.clone(),
            self.time.clone(),
        )
    }
}

#[derive(Debug)]
pub enum BookError {
    /// Slot held by someone else, expired under the caller, or booked —
    /// a legitimate business outcome, never retried here.
    SlotUnavailable,
    ValidationFailed(&'static str),
    /// Transaction-fatal but retryable by the caller.
    PersistenceFailed(String),
    UnknownBooking,
    Internal(String),
}

impl std::fmt::Display for BookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookError::SlotUnavailable => write!(f, "slot is no longer available"),
            BookError::ValidationFailed(msg) => write!(f, "validation failed: {msg}"),
            BookError::PersistenceFailed(msg) => write!(f, "could not persist booking: {msg}"),
            BookError::UnknownBooking => write!(f, "unknown booking id"),
            BookError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for BookError {}

impl From<LockError> for BookError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Conflict | LockError::NotHolder | LockError::Expired => {
                BookError::SlotUnavailable
            }
            LockError::Store(e) => BookError::Internal(e.to_string()),
        }
    }
}

impl From<LedgerError> for BookError {
    fn from(e: LedgerError) -> Self {
        BookError::Internal(e.to_string())
    }
}

/// Drives the end-to-end booking transaction: lock → validate → persist →
/// confirm, keeping the lock manager, ledger and room hub in agreement.
///
/// Ordering invariant: the ledger and the hub only ever observe transitions
/// the lock manager has already committed — they are effects of a state
/// change, never drivers of one.
pub struct BookingCoordinator {
    locks: Arc<LockManager>,
    ledger: Arc<Ledger>,
    rooms: Arc<RoomHub>,
    persistence: Arc<dyn Persistence>,
    notifier: Arc<dyn Notifier>,
    lock_ttl: Duration,
    confirm_window: Duration,
}

impl BookingCoordinator {
    pub fn new(
        locks: Arc<LockManager>,
        ledger: Arc<Ledger>,
        rooms: Arc<RoomHub>,
        persistence: Arc<dyn Persistence>,
        notifier: Arc<dyn Notifier>,
        lock_ttl: Duration,
        confirm_window: Duration,
    ) -> Self {
        // The soft deadline must never outlive the hard TTL.
        let confirm_window = confirm_window.min(lock_ttl);
        Self {
            locks,
            ledger,
            rooms,
            persistence,
            notifier,
            lock_ttl,
            confirm_window,
        }
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Take a temporary claim on a slot. On success the room sees
    /// `slot-locked` and the ledger records the acquisition; a local timer
    /// opportunistically releases the claim when the confirm window lapses
    /// (the hard TTL would reclaim it anyway — this just shortens perceived
    /// unavailability).
    pub async fn hold(&self, key: &SlotKey, client_id: &str) -> Result<(), BookError> {
        let lock = self.locks.acquire(key, client_id, self.lock_ttl).await?;

        self.ledger
            .append(key, LedgerAction::LockAcquired, client_id)
            .await?;
        self.rooms.publish(&key.room(), &SlotEvent::locked(key, client_id));

        let locks = self.locks.clone();
        let ledger = self.ledger.clone();
        let rooms = self.rooms.clone();
        let key = key.clone();
        let client_id = client_id.to_string();
        let window = self.confirm_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Scoped to this hold instance: fails with NotHolder once it
            // was confirmed, released, or superseded by a newer hold.
            if locks
                .release_if_acquired_at(&key, &client_id, lock.acquired_at)
                .await
                .is_ok()
            {
                info!(slot = %key, holder = client_id, "confirm window lapsed, lock released");
                if let Err(e) = ledger
                    .append(&key, LedgerAction::LockExpired, &client_id)
                    .await
                {
                    warn!(slot = %key, "ledger append after expiry failed: {e}");
                }
                rooms.publish(&key.room(), &SlotEvent::unlocked(&key));
            }
        });

        Ok(())
    }

    /// Give a held slot back early. Only the current holder succeeds.
    pub async fn release_hold(&self, key: &SlotKey, client_id: &str) -> Result<(), BookError> {
        self.locks.release(key, client_id).await?;
        self.ledger
            .append(key, LedgerAction::LockReleased, client_id)
            .await?;
        self.rooms.publish(&key.room(), &SlotEvent::unlocked(key));
        Ok(())
    }

    /// Convert a held slot into a confirmed booking.
    pub async fn confirm_booking(
        &self,
        key: &SlotKey,
        client_id: &str,
        patient_id: &str,
        details: BookingDetails,
    ) -> Result<Appointment, BookError> {
        if let Err(reason) = validate(patient_id, &details) {
            self.abort_hold(key, client_id).await;
            return Err(BookError::ValidationFailed(reason));
        }

        let appointment = Appointment {
            id: Ulid::new(),
            slot: key.clone(),
            patient_id: patient_id.to_string(),
            details,
            confirmed_at: now_ms(),
            status: AppointmentStatus::Confirmed,
        };

        // Persist before confirm: the slot must never stay durably locked
        // against a booking that doesn't exist.
        if let Err(e) = self.persistence.persist(&appointment).await {
            self.abort_hold(key, client_id).await;
            return Err(BookError::PersistenceFailed(e.to_string()));
        }

        if let Err(e) = self.locks.confirm(key, client_id).await {
            // Expiry won the race — the persisted record is orphaned,
            // cancel it best-effort.
            if let Err(pe) = self.persistence.cancel(&appointment.id).await {
                warn!(booking = %appointment.id, "could not cancel orphaned record: {pe}");
            }
            return Err(e.into());
        }

        metrics::counter!(crate::observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
        if let Err(e) = self
            .ledger
            .append(key, LedgerAction::BookingConfirmed, client_id)
            .await
        {
            // The booking is committed; a missing audit entry is logged
            // loudly but does not undo it.
            tracing::error!(slot = %key, "ledger append after confirm failed: {e}");
        }
        let event = SlotEvent::booked(key, client_id);
        self.rooms.publish(&key.room(), &event);
        if let Err(e) = self.notifier.notify(&event).await {
            warn!(slot = %key, "notification failed: {e}");
        }

        info!(booking = %appointment.id, slot = %key, patient = patient_id, "booking confirmed");
        Ok(appointment)
    }

    /// One-shot flow used by the REST surface: acquire, then immediately
    /// confirm with the supplied details.
    pub async fn book(&self, request: &BookRequest) -> Result<Appointment, BookError> {
        let key = request.slot_key();
        self.hold(&key, &request.patient_id).await?;
        self.confirm_booking(
            &key,
            &request.patient_id,
            &request.patient_id,
            request.details.clone(),
        )
        .await
    }

    /// Cancel a confirmed booking, returning its slot to `Free`.
    pub async fn cancel(&self, booking_id: &Ulid) -> Result<Appointment, BookError> {
        let appointment = self
            .persistence
            .fetch(booking_id)
            .await
            .map_err(|e| BookError::PersistenceFailed(e.to_string()))?
            .ok_or(BookError::UnknownBooking)?;
        if appointment.status == AppointmentStatus::Cancelled {
            return Err(BookError::UnknownBooking);
        }

        let key = &appointment.slot;
        self.locks.cancel(key, &appointment.patient_id).await?;
        if let Err(e) = self.persistence.cancel(booking_id).await {
            warn!(booking = %booking_id, "record cancellation failed: {e}");
        }
        self.ledger
            .append(key, LedgerAction::BookingCancelled, &appointment.patient_id)
            .await?;
        self.rooms.publish(&key.room(), &SlotEvent::unlocked(key));
        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);

        info!(booking = %booking_id, slot = %key, "booking cancelled");
        Ok(appointment)
    }

    /// Release the old slot and run a fresh acquire+confirm on the new one.
    pub async fn reschedule(
        &self,
        booking_id: &Ulid,
        new_slot: SlotKey,
    ) -> Result<Appointment, BookError> {
        let old = self.cancel(booking_id).await?;
        let request = BookRequest {
            resource_id: new_slot.resource_id,
            date: new_slot.date,
            time: new_slot.time,
            patient_id: old.patient_id,
            details: old.details,
        };
        self.book(&request).await
    }

    /// Undo a held-but-unconfirmable slot: release, record, broadcast.
    async fn abort_hold(&self, key: &SlotKey, client_id: &str) {
        match self.locks.release(key, client_id).await {
            Ok(()) => {
                if let Err(e) = self
                    .ledger
                    .append(key, LedgerAction::LockReleased, client_id)
                    .await
                {
                    warn!(slot = %key, "ledger append after release failed: {e}");
                }
                self.rooms.publish(&key.room(), &SlotEvent::unlocked(key));
            }
            // Already expired or taken over — nothing left to undo.
            Err(e) => tracing::debug!(slot = %key, "abort skipped: {e}"),
        }
    }
}

fn validate(patient_id: &str, details: &BookingDetails) -> Result<(), &'static str> {
    if patient_id.trim().is_empty() {
        return Err("patient id is required");
    }
    if !details.consent {
        return Err("patient consent is required");
    }
    Ok(())
}
