//! Room registry: lazily-constructed per-room contexts, plus the record
//! store that owns room metadata.
//!
//! Everything the coordinator shares between sessions is partitioned by
//! room id — hub, presence, leases, snapshot — so there are no cross-room
//! locks. Construction is idempotent: concurrent callers observe the
//! same `RoomCtx` instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{Mutex, RwLock};

use crate::broadcast::Hub;
use crate::lease::LeaseStore;
use crate::presence::PresenceStore;
use crate::server::ServerConfig;
use crate::snapshot::SnapshotStore;

/// Room metadata as held by the record store.
#[derive(Debug, Clone)]
pub struct RoomMeta {
    pub id: String,
    pub title: String,
    pub max_users: usize,
    pub created_at: SystemTime,
}

/// Record store errors. The in-memory backend never fails; a networked
/// backend maps outages onto `Unavailable`, which Opening surfaces as
/// close 1011.
#[derive(Debug, Clone)]
pub enum RecordError {
    Unavailable(String),
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(e) => write!(f, "room record store unavailable: {e}"),
        }
    }
}

impl std::error::Error for RecordError {}

/// Keyed store of room definitions with get-or-create semantics.
#[derive(Debug)]
pub struct RecordStore {
    rooms: Mutex<HashMap<String, RoomMeta>>,
    default_max_users: usize,
}

impl RecordStore {
    pub fn new(default_max_users: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            default_max_users,
        }
    }

    /// Fetch the room record, creating it with defaults on first access.
    pub async fn get_or_create(&self, room_id: &str) -> Result<RoomMeta, RecordError> {
        let mut rooms = self.rooms.lock().await;
        let meta = rooms.entry(room_id.to_string()).or_insert_with(|| RoomMeta {
            id: room_id.to_string(),
            title: format!("Room {room_id}"),
            max_users: self.default_max_users,
            created_at: SystemTime::now(),
        });
        Ok(meta.clone())
    }
}

/// Everything one room shares between its sessions.
pub struct RoomCtx {
    pub id: String,
    pub meta: RoomMeta,
    pub hub: Hub,
    pub presence: PresenceStore,
    pub leases: LeaseStore,
    pub snapshot: SnapshotStore,
}

/// Process-wide map of room id → context.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<RoomCtx>>>,
    records: RecordStore,
    config: Arc<ServerConfig>,
}

impl RoomRegistry {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            records: RecordStore::new(config.max_users_default),
            config,
        }
    }

    /// Resolve a room context, constructing it on first access.
    pub async fn get_or_create(&self, room_id: &str) -> Result<Arc<RoomCtx>, RecordError> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return Ok(room.clone());
            }
        }

        let meta = self.records.get_or_create(room_id).await?;

        // Slow path: write lock, double-check after acquiring
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            return Ok(room.clone());
        }

        log::info!(
            "room {room_id} created (max_users={})",
            meta.max_users
        );
        let room = Arc::new(RoomCtx {
            id: room_id.to_string(),
            hub: Hub::new(self.config.session_outbound_queue),
            presence: PresenceStore::new(self.config.color_palette.clone()),
            leases: LeaseStore::new(),
            snapshot: SnapshotStore::new(self.config.snapshot_max_bytes),
            meta,
        });
        rooms.insert(room_id.to_string(), room.clone());
        Ok(room)
    }

    /// All live room contexts, for the reaper sweep.
    pub async fn rooms(&self) -> Vec<Arc<RoomCtx>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
