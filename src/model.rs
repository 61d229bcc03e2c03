use serde::{Deserialize, Serialize};

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Composite identity of one bookable slot: `(resource, date, start time)`.
/// Immutable once constructed; the store key for the unit of contention.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub resource_id: String,
    pub date: String,
    pub time: String,
}

impl SlotKey {
    pub fn new(
        resource_id: impl Into<String>,
        date: impl Into<String>,
        time: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            date: date.into(),
            time: time.into(),
        }
    }

    /// The broadcast room grouping all observers of one resource/day.
    pub fn room(&self) -> String {
        format!("{}:{}", self.resource_id, self.date)
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.resource_id, self.date, self.time)
    }
}

/// Current state of a slot as seen by observers. Absence of a store
/// entry means `Free`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum SlotStatus {
    Free,
    Locked { holder: String },
    Booked { holder: String },
}

/// Booking action recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerAction {
    LockAcquired,
    LockReleased,
    LockExpired,
    BookingConfirmed,
    BookingCancelled,
}

impl LedgerAction {
    /// Stable hash form. The chain hash is computed over this string,
    /// so variants must never be renamed once entries exist.
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerAction::LockAcquired => "lock-acquired",
            LedgerAction::LockReleased => "lock-released",
            LedgerAction::LockExpired => "lock-expired",
            LedgerAction::BookingConfirmed => "booking-confirmed",
            LedgerAction::BookingCancelled => "booking-cancelled",
        }
    }
}

/// Slot-state transitions fanned out to room subscribers. Volatile
/// projection of the store's authoritative state, never a source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SlotEvent {
    SlotLocked {
        resource_id: String,
        date: String,
        time: String,
        client_id: String,
    },
    SlotUnlocked {
        resource_id: String,
        date: String,
        time: String,
    },
    BookingConfirmed {
        resource_id: String,
        date: String,
        time: String,
        client_id: String,
    },
}

impl SlotEvent {
    pub fn locked(key: &SlotKey, client_id: &str) -> Self {
        SlotEvent::SlotLocked {
            resource_id: key.resource_id.clone(),
            date: key.date.clone(),
            time: key.time.clone(),
            client_id: client_id.to_string(),
        }
    }

    pub fn unlocked(key: &SlotKey) -> Self {
        SlotEvent::SlotUnlocked {
            resource_id: key.resource_id.clone(),
            date: key.date.clone(),
            time: key.time.clone(),
        }
    }

    pub fn booked(key: &SlotKey, client_id: &str) -> Self {
        SlotEvent::BookingConfirmed {
            resource_id: key.resource_id.clone(),
            date: key.date.clone(),
            time: key.time.clone(),
            client_id: client_id.to_string(),
        }
    }
}

/// Messages a connected client may send over the room socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom {
        room: String,
    },
    LeaveRoom {
        room: String,
    },
    LockSlot {
        resource_id: String,
        date: String,
        time: String,
        client_id: String,
    },
    UnlockSlot {
        resource_id: String,
        date: String,
        time: String,
        client_id: String,
    },
}
