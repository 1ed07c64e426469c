//! Per-room lease table: time-bounded exclusive edit ownership of blocks.
//!
//! A lease maps a block id to its owner and an expiry instant. The table
//! keeps a reverse index from owner to held keys so a disconnecting
//! session can shed everything it owns in one call. Both maps live behind
//! a single mutex, which is what makes the multi-key operations atomic:
//! concurrent callers observe one of the serializable outcomes, never a
//! partial batch.
//!
//! A lease whose expiry is in the past is treated as absent on every
//! read, even before it is garbage collected. Callers should not assume
//! wall-clock precision finer than one second.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

/// Opaque block identifier, scoped to a room.
pub type BlockId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lease {
    owner: Uuid,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LeaseTable {
    by_key: HashMap<BlockId, Lease>,
    by_owner: HashMap<Uuid, HashSet<BlockId>>,
}

impl LeaseTable {
    /// Active lease for `key`, evicting it lazily if expired.
    fn active(&mut self, key: &str, now: Instant) -> Option<Lease> {
        match self.by_key.get(key) {
            Some(lease) if lease.expires_at > now => Some(*lease),
            Some(lease) => {
                let owner = lease.owner;
                self.by_key.remove(key);
                self.unindex(key, owner);
                None
            }
            None => None,
        }
    }

    fn install(&mut self, key: BlockId, owner: Uuid, expires_at: Instant) {
        self.by_owner.entry(owner).or_default().insert(key.clone());
        self.by_key.insert(key, Lease { owner, expires_at });
    }

    fn drop_lease(&mut self, key: &str, owner: Uuid) {
        self.by_key.remove(key);
        self.unindex(key, owner);
    }

    fn unindex(&mut self, key: &str, owner: Uuid) {
        if let Some(keys) = self.by_owner.get_mut(&owner) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
    }
}

/// Outcome of a conflicting acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub key: BlockId,
    pub owner: Uuid,
    /// Remaining TTL of the conflicting lease.
    pub remaining: Duration,
}

/// Result of `acquire` / `acquire_many`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The whole batch is now held by the caller. `acquired` lists only
    /// the newly-owned keys; keys the caller already held were refreshed
    /// and are not repeated here.
    Granted { acquired: Vec<BlockId> },
    /// At least one key is held by someone else; no state changed.
    Denied { conflicts: Vec<Conflict> },
}

/// Result of a single-key release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotOwner,
    NotHeld,
}

/// Lease store for one room. The sole authority on lease state; callers
/// never cache lease ownership across operations.
#[derive(Debug, Default)]
pub struct LeaseStore {
    inner: Mutex<LeaseTable>,
}

impl LeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-and-set for a single key.
    pub async fn acquire(&self, key: &str, owner: Uuid, ttl: Duration) -> AcquireOutcome {
        self.acquire_many(std::slice::from_ref(&key.to_string()), owner, ttl)
            .await
    }

    /// All-or-nothing acquisition across a batch of keys.
    ///
    /// If any key is actively held by a different owner, nothing changes
    /// and every conflicting key is reported. Keys already held by the
    /// caller have their TTL refreshed.
    pub async fn acquire_many(
        &self,
        keys: &[BlockId],
        owner: Uuid,
        ttl: Duration,
    ) -> AcquireOutcome {
        let mut table = self.inner.lock().await;
        let now = Instant::now();

        let mut conflicts = Vec::new();
        for key in keys {
            if let Some(lease) = table.active(key, now) {
                if lease.owner != owner {
                    conflicts.push(Conflict {
                        key: key.clone(),
                        owner: lease.owner,
                        remaining: lease.expires_at.saturating_duration_since(now),
                    });
                }
            }
        }
        if !conflicts.is_empty() {
            return AcquireOutcome::Denied { conflicts };
        }

        let expires_at = now + ttl;
        let mut acquired = Vec::new();
        for key in keys {
            let newly_owned = table.active(key, now).is_none();
            table.install(key.clone(), owner, expires_at);
            if newly_owned {
                acquired.push(key.clone());
            }
        }
        AcquireOutcome::Granted { acquired }
    }

    /// Release one key if `owner` holds it.
    pub async fn release(&self, key: &str, owner: Uuid) -> ReleaseOutcome {
        let mut table = self.inner.lock().await;
        let now = Instant::now();
        match table.active(key, now) {
            None => ReleaseOutcome::NotHeld,
            Some(lease) if lease.owner != owner => ReleaseOutcome::NotOwner,
            Some(_) => {
                table.drop_lease(key, owner);
                ReleaseOutcome::Released
            }
        }
    }

    /// Owner-gated batch release. Keys held by others are left untouched.
    /// Returns the keys actually released.
    pub async fn release_many(&self, keys: &[BlockId], owner: Uuid) -> Vec<BlockId> {
        let mut table = self.inner.lock().await;
        let now = Instant::now();
        let mut released = Vec::new();
        for key in keys {
            if matches!(table.active(key, now), Some(lease) if lease.owner == owner) {
                table.drop_lease(key, owner);
                released.push(key.clone());
            }
        }
        released
    }

    /// Release every lease belonging to `owner`. Returns the released
    /// keys; a second call for the same owner returns the empty list.
    pub async fn release_all(&self, owner: Uuid) -> Vec<BlockId> {
        let mut table = self.inner.lock().await;
        let now = Instant::now();
        let keys: Vec<BlockId> = match table.by_owner.get(&owner) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return Vec::new(),
        };
        let mut released = Vec::new();
        for key in keys {
            if table.active(&key, now).is_some() {
                table.drop_lease(&key, owner);
                released.push(key);
            }
        }
        table.by_owner.remove(&owner);
        released
    }

    /// Idempotently refresh the TTL of each listed key held by `owner`.
    /// Keys held by others or not held at all are skipped. Returns the
    /// number of refreshed leases.
    pub async fn extend_by_owner(
        &self,
        owner: Uuid,
        keys: &[BlockId],
        ttl: Duration,
    ) -> usize {
        let mut table = self.inner.lock().await;
        let now = Instant::now();
        let expires_at = now + ttl;
        let mut refreshed = 0;
        for key in keys {
            if matches!(table.active(key, now), Some(lease) if lease.owner == owner) {
                table.install(key.clone(), owner, expires_at);
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Current owner of `key`, if actively leased.
    pub async fn owner_of(&self, key: &str) -> Option<Uuid> {
        let mut table = self.inner.lock().await;
        table.active(key, Instant::now()).map(|lease| lease.owner)
    }

    /// Map of all active leases, for `INIT_STATE`.
    pub async fn snapshot(&self) -> HashMap<BlockId, Uuid> {
        let table = self.inner.lock().await;
        let now = Instant::now();
        table
            .by_key
            .iter()
            .filter(|(_, lease)| lease.expires_at > now)
            .map(|(key, lease)| (key.clone(), lease.owner))
            .collect()
    }
}
