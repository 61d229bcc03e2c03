use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::{Ms, SlotKey};

/// Stored value for one slot. `expires_at` is `None` once booked — the
/// entry is then permanent until explicitly cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub holder: String,
    pub acquired_at: Ms,
    pub expires_at: Option<Ms>,
    pub booked: bool,
}

impl SlotEntry {
    pub fn locked(holder: impl Into<String>, acquired_at: Ms, expires_at: Ms) -> Self {
        Self {
            holder: holder.into(),
            acquired_at,
            expires_at: Some(expires_at),
            booked: false,
        }
    }

    /// A dead entry is indistinguishable from an absent one.
    pub fn is_live(&self, now: Ms) -> bool {
        self.booked || self.expires_at.is_none_or(|e| e > now)
    }
}

#[derive(Debug)]
pub enum StoreError {
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "slot store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Outcome of a conditional set-if-absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// A live entry already exists; returned so the caller can tell an
    /// idempotent re-acquire from a genuine conflict.
    Held(SlotEntry),
}

/// Outcome of a holder-conditional update or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOutcome {
    Applied,
    /// A live entry exists but the caller is not (or no longer) its holder,
    /// or the entry is in a state the operation does not apply to.
    NotHolder,
    /// No live entry — absent or expired.
    Missing,
}

/// Shared, atomic key/value store holding the current owner of each slot.
///
/// Every method is a single conditional command: the check and the mutation
/// happen atomically for a given key, which is what makes per-slot state
/// transitions linearizable without application-level locking. Callers pass
/// `now` so the store never consults a clock of its own.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// SET-if-absent with expiry. Dead entries count as absent.
    async fn put_if_absent(
        &self,
        key: &SlotKey,
        entry: SlotEntry,
        now: Ms,
    ) -> Result<PutOutcome, StoreError>;

    /// Extend the TTL of a live, unbooked entry held by `holder`.
    /// A booked entry has no TTL and yields `NotHolder`.
    async fn extend_if_holder(
        &self,
        key: &SlotKey,
        holder: &str,
        new_expires_at: Ms,
        now: Ms,
    ) -> Result<CondOutcome, StoreError>;

    /// Convert a live entry held by `holder` to a permanent booking
    /// (TTL cleared). Idempotent if already booked by the same holder.
    async fn book_if_holder(
        &self,
        key: &SlotKey,
        holder: &str,
        now: Ms,
    ) -> Result<CondOutcome, StoreError>;

    /// Remove a live entry held by `holder`. With `include_booked` false,
    /// a booked entry is left untouched and yields `NotHolder` — this is
    /// what keeps a late expiry timer from deleting a confirmed booking.
    /// When `acquired_at` is given the entry must also have been acquired
    /// at that exact instant, so a timer spawned for one hold can never
    /// remove a later hold of the same slot by the same client.
    async fn delete_if_holder(
        &self,
        key: &SlotKey,
        holder: &str,
        include_booked: bool,
        acquired_at: Option<Ms>,
        now: Ms,
    ) -> Result<CondOutcome, StoreError>;

    /// Read the current live entry, if any.
    async fn get(&self, key: &SlotKey, now: Ms) -> Result<Option<SlotEntry>, StoreError>;
}

/// In-process store backed by a concurrent map. Atomicity comes from the
/// map's per-key entry guard; expiry is lazy — any operation that observes
/// a dead entry reclaims it in place, so no reaper task exists.
pub struct MemoryStore {
    slots: DashMap<SlotKey, SlotEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SlotStore for MemoryStore {
    async fn put_if_absent(
        &self,
        key: &SlotKey,
        entry: SlotEntry,
        now: Ms,
    ) -> Result<PutOutcome, StoreError> {
        match self.slots.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                if occ.get().is_live(now) {
                    Ok(PutOutcome::Held(occ.get().clone()))
                } else {
                    occ.insert(entry);
                    Ok(PutOutcome::Stored)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                vac.insert(entry);
                Ok(PutOutcome::Stored)
            }
        }
    }

    async fn extend_if_holder(
        &self,
        key: &SlotKey,
        holder: &str,
        new_expires_at: Ms,
        now: Ms,
    ) -> Result<CondOutcome, StoreError> {
        match self.slots.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                if !occ.get().is_live(now) {
                    occ.remove();
                    return Ok(CondOutcome::Missing);
                }
                if occ.get().holder != holder || occ.get().booked {
                    return Ok(CondOutcome::NotHolder);
                }
                occ.get_mut().expires_at = Some(new_expires_at);
                Ok(CondOutcome::Applied)
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Ok(CondOutcome::Missing),
        }
    }

    async fn book_if_holder(
        &self,
        key: &SlotKey,
        holder: &str,
        now: Ms,
    ) -> Result<CondOutcome, StoreError> {
        match self.slots.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                if !occ.get().is_live(now) {
                    occ.remove();
                    return Ok(CondOutcome::Missing);
                }
                if occ.get().holder != holder {
                    return Ok(CondOutcome::NotHolder);
                }
                let entry = occ.get_mut();
                entry.booked = true;
                entry.expires_at = None;
                Ok(CondOutcome::Applied)
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Ok(CondOutcome::Missing),
        }
    }

    async fn delete_if_holder(
        &self,
        key: &SlotKey,
        holder: &str,
        include_booked: bool,
        acquired_at: Option<Ms>,
        now: Ms,
    ) -> Result<CondOutcome, StoreError> {
        match self.slots.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occ) => {
                if !occ.get().is_live(now) {
                    occ.remove();
                    return Ok(CondOutcome::Missing);
                }
                if occ.get().holder != holder
                    || (occ.get().booked && !include_booked)
                    || acquired_at.is_some_and(|t| occ.get().acquired_at != t)
                {
                    return Ok(CondOutcome::NotHolder);
                }
                occ.remove();
                Ok(CondOutcome::Applied)
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Ok(CondOutcome::Missing),
        }
    }

    async fn get(&self, key: &SlotKey, now: Ms) -> Result<Option<SlotEntry>, StoreError> {
        match self.slots.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.clone())),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SlotKey {
        SlotKey::new("D1", "2024-05-01", "09:00")
    }

    #[tokio::test]
    async fn put_if_absent_rejects_live_entry() {
        let store = MemoryStore::new();
        let first = SlotEntry::locked("alice", 1000, 5000);
        assert_eq!(
            store.put_if_absent(&key(), first.clone(), 1000).await.unwrap(),
            PutOutcome::Stored
        );
        let second = SlotEntry::locked("bob", 1500, 6000);
        assert_eq!(
            store.put_if_absent(&key(), second, 1500).await.unwrap(),
            PutOutcome::Held(first)
        );
    }

    #[tokio::test]
    async fn expired_entry_counts_as_absent() {
        let store = MemoryStore::new();
        store
            .put_if_absent(&key(), SlotEntry::locked("alice", 1000, 2000), 1000)
            .await
            .unwrap();
        // Past expiry — bob can take the slot
        let outcome = store
            .put_if_absent(&key(), SlotEntry::locked("bob", 3000, 8000), 3000)
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Stored);
        let entry = store.get(&key(), 3000).await.unwrap().unwrap();
        assert_eq!(entry.holder, "bob");
    }

    #[tokio::test]
    async fn extend_requires_live_matching_holder() {
        let store = MemoryStore::new();
        store
            .put_if_absent(&key(), SlotEntry::locked("alice", 1000, 2000), 1000)
            .await
            .unwrap();

        assert_eq!(
            store.extend_if_holder(&key(), "bob", 9000, 1500).await.unwrap(),
            CondOutcome::NotHolder
        );
        assert_eq!(
            store.extend_if_holder(&key(), "alice", 9000, 1500).await.unwrap(),
            CondOutcome::Applied
        );
        // Stale extend after expiry
        assert_eq!(
            store.extend_if_holder(&key(), "alice", 20000, 10000).await.unwrap(),
            CondOutcome::Missing
        );
    }

    #[tokio::test]
    async fn book_clears_ttl_and_survives_time() {
        let store = MemoryStore::new();
        store
            .put_if_absent(&key(), SlotEntry::locked("alice", 1000, 2000), 1000)
            .await
            .unwrap();
        assert_eq!(
            store.book_if_holder(&key(), "alice", 1500).await.unwrap(),
            CondOutcome::Applied
        );
        // Long past the original TTL the booking is still live
        let entry = store.get(&key(), 99_000).await.unwrap().unwrap();
        assert!(entry.booked);
        assert_eq!(entry.expires_at, None);
        // Idempotent re-book by the same holder
        assert_eq!(
            store.book_if_holder(&key(), "alice", 99_000).await.unwrap(),
            CondOutcome::Applied
        );
    }

    #[tokio::test]
    async fn delete_skips_booked_unless_included() {
        let store = MemoryStore::new();
        store
            .put_if_absent(&key(), SlotEntry::locked("alice", 1000, 2000), 1000)
            .await
            .unwrap();
        store.book_if_holder(&key(), "alice", 1500).await.unwrap();

        assert_eq!(
            store
                .delete_if_holder(&key(), "alice", false, None, 1600)
                .await
                .unwrap(),
            CondOutcome::NotHolder
        );
        assert_eq!(
            store
                .delete_if_holder(&key(), "alice", true, None, 1600)
                .await
                .unwrap(),
            CondOutcome::Applied
        );
        assert!(store.get(&key(), 1600).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_conditioned_on_acquisition_instant() {
        let store = MemoryStore::new();
        store
            .put_if_absent(&key(), SlotEntry::locked("alice", 1000, 5000), 1000)
            .await
            .unwrap();

        // A delete aimed at an earlier hold of the same slot leaves the
        // current one alone
        assert_eq!(
            store
                .delete_if_holder(&key(), "alice", false, Some(500), 1500)
                .await
                .unwrap(),
            CondOutcome::NotHolder
        );
        assert!(store.get(&key(), 1500).await.unwrap().is_some());

        assert_eq!(
            store
                .delete_if_holder(&key(), "alice", false, Some(1000), 1500)
                .await
                .unwrap(),
            CondOutcome::Applied
        );
        assert!(store.get(&key(), 1500).await.unwrap().is_none());
    }
}
