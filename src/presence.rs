//! Per-room participant tracking.
//!
//! Each participant lives from admission to disconnect or reaping. The
//! store records nickname, color, and a `last_seen` instant that every
//! accepted inbound frame refreshes; the reaper uses `stale_since` to
//! find participants whose connection has gone quiet.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex;
use uuid::Uuid;

/// Default cursor palette; assignment cycles through it in join order.
pub const DEFAULT_PALETTE: [&str; 4] = ["#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A"];

const NICKNAME_MAX_BYTES: usize = 64;

/// One connected participant.
#[derive(Debug, Clone)]
pub struct Participant {
    pub client_id: Uuid,
    pub nickname: String,
    pub color: String,
    pub last_seen: Instant,
}

#[derive(Debug, Default)]
struct PresenceTable {
    users: HashMap<Uuid, Participant>,
    /// Monotonic join counter; drives deterministic color assignment.
    joined: u64,
}

/// Presence store for one room.
#[derive(Debug)]
pub struct PresenceStore {
    palette: Vec<String>,
    inner: Mutex<PresenceTable>,
}

impl PresenceStore {
    /// Create a store with the given color palette. An empty palette
    /// falls back to the default.
    pub fn new(palette: Vec<String>) -> Self {
        let palette = if palette.is_empty() {
            DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect()
        } else {
            palette
        };
        Self {
            palette,
            inner: Mutex::new(PresenceTable::default()),
        }
    }

    /// Admit a participant if the room has capacity.
    ///
    /// Capacity check and insertion happen under one lock so two racing
    /// joins cannot both slip into the last seat. Returns `None` when the
    /// room is full.
    pub async fn add(
        &self,
        client_id: Uuid,
        nickname: String,
        max_users: usize,
    ) -> Option<Participant> {
        let mut table = self.inner.lock().await;
        if table.users.len() >= max_users {
            return None;
        }
        let color = self.palette[(table.joined as usize) % self.palette.len()].clone();
        table.joined += 1;
        let participant = Participant {
            client_id,
            nickname,
            color,
            last_seen: Instant::now(),
        };
        table.users.insert(client_id, participant.clone());
        Some(participant)
    }

    /// Remove a participant. Returns the removed entry, or `None` if it
    /// was already gone — callers use this to keep departure effects
    /// at-most-once.
    pub async fn remove(&self, client_id: Uuid) -> Option<Participant> {
        self.inner.lock().await.users.remove(&client_id)
    }

    /// Refresh `last_seen` for a participant, if present.
    pub async fn touch(&self, client_id: Uuid) {
        if let Some(p) = self.inner.lock().await.users.get_mut(&client_id) {
            p.last_seen = Instant::now();
        }
    }

    pub async fn list(&self) -> Vec<Participant> {
        self.inner.lock().await.users.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.users.len()
    }

    /// Participants whose `last_seen` predates `threshold`.
    pub async fn stale_since(&self, threshold: Instant) -> Vec<Uuid> {
        self.inner
            .lock()
            .await
            .users
            .values()
            .filter(|p| p.last_seen < threshold)
            .map(|p| p.client_id)
            .collect()
    }
}

/// Normalize the nickname query parameter: bound to 64 bytes, replace
/// absent/empty values with a placeholder derived from the client id.
/// The raw value is stored as-is; whitespace only matters for deciding
/// emptiness.
pub fn sanitize_nickname(raw: Option<&str>, client_id: Uuid) -> String {
    match raw {
        Some(name) if !name.trim().is_empty() => {
            truncate_bytes(name, NICKNAME_MAX_BYTES).to_string()
        }
        _ => format!("User{:04}", client_id.as_u128() % 10_000),
    }
}

/// Truncate to at most `max` bytes on a char boundary.
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
