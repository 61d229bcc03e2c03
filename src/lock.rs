use std::sync::Arc;
use std::time::Duration;

use crate::model::{now_ms, Ms, SlotKey, SlotStatus};
use crate::store::{CondOutcome, PutOutcome, SlotEntry, SlotStore, StoreError};

#[derive(Debug)]
pub enum LockError {
    /// A live entry exists for another holder (or the slot is booked).
    Conflict,
    /// The caller is not the current holder.
    NotHolder,
    /// The caller's lock expired before the operation committed.
    Expired,
    Store(StoreError),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Conflict => write!(f, "slot already held"),
            LockError::NotHolder => write!(f, "caller is not the slot holder"),
            LockError::Expired => write!(f, "lock expired"),
            LockError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LockError {}

impl From<StoreError> for LockError {
    fn from(e: StoreError) -> Self {
        LockError::Store(e)
    }
}

/// Token returned from a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLock {
    pub key: SlotKey,
    pub holder: String,
    pub acquired_at: Ms,
    pub expires_at: Ms,
}

/// Enforces at-most-one-holder-per-slot and the slot state machine
/// `Free → Locked(holder) → Booked` / `Locked → Free`.
///
/// Every operation is one conditional store command; ambiguous or stale
/// state fails closed (`Conflict`/`NotHolder`/`Expired`) and is never
/// retried here — slot contention is a business outcome, not a fault.
pub struct LockManager {
    store: Arc<dyn SlotStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn SlotStore>) -> Self {
        Self { store }
    }

    /// Atomic set-if-absent. Idempotent when the caller already holds the
    /// (unbooked) lock; no side effects on conflict.
    pub async fn acquire(
        &self,
        key: &SlotKey,
        client_id: &str,
        ttl: Duration,
    ) -> Result<SlotLock, LockError> {
        let now = now_ms();
        let expires_at = now + ttl.as_millis() as Ms;
        let entry = SlotEntry::locked(client_id, now, expires_at);
        match self.store.put_if_absent(key, entry, now).await? {
            PutOutcome::Stored => {
                metrics::counter!(crate::observability::LOCKS_ACQUIRED_TOTAL).increment(1);
                tracing::debug!(slot = %key, holder = client_id, "lock acquired");
                Ok(SlotLock {
                    key: key.clone(),
                    holder: client_id.to_string(),
                    acquired_at: now,
                    expires_at,
                })
            }
            PutOutcome::Held(existing)
                if existing.holder == client_id && !existing.booked =>
            {
                // Caller already holds it — report the existing claim as-is.
                Ok(SlotLock {
                    key: key.clone(),
                    holder: client_id.to_string(),
                    acquired_at: existing.acquired_at,
                    expires_at: existing.expires_at.unwrap_or(expires_at),
                })
            }
            PutOutcome::Held(_) => {
                metrics::counter!(crate::observability::LOCK_CONFLICTS_TOTAL).increment(1);
                Err(LockError::Conflict)
            }
        }
    }

    /// Extend the TTL, only while the stored holder still matches. A stale
    /// client cannot resurrect an expired lock.
    pub async fn renew(
        &self,
        key: &SlotKey,
        client_id: &str,
        ttl: Duration,
    ) -> Result<(), LockError> {
        let now = now_ms();
        let new_expires_at = now + ttl.as_millis() as Ms;
        match self
            .store
            .extend_if_holder(key, client_id, new_expires_at, now)
            .await?
        {
            CondOutcome::Applied => Ok(()),
            CondOutcome::NotHolder => Err(LockError::NotHolder),
            CondOutcome::Missing => Err(LockError::Expired),
        }
    }

    /// `Locked(client) → Booked`. The holder is re-checked inside the
    /// store's atomic section, which closes the race between expiry and a
    /// late confirm. On success the entry is permanent (TTL cleared).
    pub async fn confirm(&self, key: &SlotKey, client_id: &str) -> Result<(), LockError> {
        let now = now_ms();
        match self.store.book_if_holder(key, client_id, now).await? {
            CondOutcome::Applied => {
                tracing::debug!(slot = %key, holder = client_id, "slot booked");
                Ok(())
            }
            CondOutcome::NotHolder => Err(LockError::NotHolder),
            CondOutcome::Missing => Err(LockError::Expired),
        }
    }

    /// `Locked(client) → Free`. Leaves booked entries untouched; a second
    /// release returns `NotHolder` without any other effect.
    pub async fn release(&self, key: &SlotKey, client_id: &str) -> Result<(), LockError> {
        self.release_inner(key, client_id, None).await
    }

    /// Like `release`, but scoped to the hold instance acquired at
    /// `acquired_at`. A timer holding a stale instance cannot release a
    /// later hold of the same slot by the same client.
    pub async fn release_if_acquired_at(
        &self,
        key: &SlotKey,
        client_id: &str,
        acquired_at: Ms,
    ) -> Result<(), LockError> {
        self.release_inner(key, client_id, Some(acquired_at)).await
    }

    async fn release_inner(
        &self,
        key: &SlotKey,
        client_id: &str,
        acquired_at: Option<Ms>,
    ) -> Result<(), LockError> {
        let now = now_ms();
        match self
            .store
            .delete_if_holder(key, client_id, false, acquired_at, now)
            .await?
        {
            CondOutcome::Applied => {
                metrics::counter!(crate::observability::LOCKS_RELEASED_TOTAL).increment(1);
                tracing::debug!(slot = %key, holder = client_id, "lock released");
                Ok(())
            }
            CondOutcome::NotHolder | CondOutcome::Missing => Err(LockError::NotHolder),
        }
    }

    /// `Booked(client) → Free`. Used by cancellation, the only path that
    /// may remove a permanent booking marker.
    pub async fn cancel(&self, key: &SlotKey, client_id: &str) -> Result<(), LockError> {
        let now = now_ms();
        match self
            .store
            .delete_if_holder(key, client_id, true, None, now)
            .await?
        {
            CondOutcome::Applied => {
                tracing::debug!(slot = %key, holder = client_id, "booking cancelled");
                Ok(())
            }
            CondOutcome::NotHolder | CondOutcome::Missing => Err(LockError::NotHolder),
        }
    }

    /// Read-only view for observers reconciling state after reconnect.
    pub async fn status(&self, key: &SlotKey) -> Result<SlotStatus, LockError> {
        let now = now_ms();
        Ok(match self.store.get(key, now).await? {
            None => SlotStatus::Free,
            Some(entry) if entry.booked => SlotStatus::Booked {
                holder: entry.holder,
            },
            Some(entry) => SlotStatus::Locked {
                holder: entry.holder,
            },
        })
    }
}
