//! Per-room workspace snapshot: the latest serialized view of the shared
//! document, last-writer-wins, opaque to the server.

use std::time::Instant;

use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Snapshot {
    payload: String,
    updated_at: Instant,
}

/// Snapshot store for one room. Keeps only the most recent payload; no
/// history. Writes larger than the configured cap are rejected.
#[derive(Debug)]
pub struct SnapshotStore {
    max_bytes: usize,
    inner: Mutex<Option<Snapshot>>,
}

/// Snapshot store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    TooLarge { size: usize, max: usize },
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge { size, max } => {
                write!(f, "snapshot of {size} bytes exceeds cap of {max} bytes")
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

impl SnapshotStore {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(None),
        }
    }

    /// Store a payload, replacing any previous one.
    pub async fn put(&self, payload: String) -> Result<(), SnapshotError> {
        if payload.len() > self.max_bytes {
            return Err(SnapshotError::TooLarge {
                size: payload.len(),
                max: self.max_bytes,
            });
        }
        *self.inner.lock().await = Some(Snapshot {
            payload,
            updated_at: Instant::now(),
        });
        Ok(())
    }

    pub async fn get(&self) -> Option<String> {
        self.inner.lock().await.as_ref().map(|s| s.payload.clone())
    }

    pub async fn updated_at(&self) -> Option<Instant> {
        self.inner.lock().await.as_ref().map(|s| s.updated_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let store = SnapshotStore::new(1024);
        assert!(store.get().await.is_none());

        store.put("<workspace/>".into()).await.unwrap();
        assert_eq!(store.get().await.as_deref(), Some("<workspace/>"));
        assert!(store.updated_at().await.is_some());
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let store = SnapshotStore::new(1024);
        store.put("<a/>".into()).await.unwrap();
        store.put("<b/>".into()).await.unwrap();
        assert_eq!(store.get().await.as_deref(), Some("<b/>"));
    }

    #[tokio::test]
    async fn test_oversize_write_rejected_and_previous_kept() {
        let store = SnapshotStore::new(8);
        store.put("<a/>".into()).await.unwrap();

        let err = store.put("x".repeat(9)).await.unwrap_err();
        assert_eq!(err, SnapshotError::TooLarge { size: 9, max: 8 });
        assert_eq!(store.get().await.as_deref(), Some("<a/>"));
    }
}
