//! Per-room fan-out hub with ordered delivery and backpressure.
//!
//! Every attached session owns a bounded frame queue drained by its
//! socket task. `broadcast` encodes a frame once and enqueues the shared
//! `Arc` to every subscriber under an order guard, so all survivors
//! observe hub frames in the same sequence — a prefix of the hub-accepted
//! order, with no gaps and no reordering. A subscriber whose queue is
//! full cannot be allowed to skip frames; it is kicked with close 1013
//! and detached instead.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications,
//! Chapter 11 (total order broadcast).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::protocol::{close, ProtocolError, ServerFrame};

/// Receiving ends handed to a session on attach.
pub struct SessionQueues {
    /// Encoded outbound frames, in hub acceptance order.
    pub frames: mpsc::Receiver<Arc<String>>,
    /// Eviction signal carrying the close code to report.
    pub kick: mpsc::Receiver<u16>,
}

struct Subscriber {
    frames: mpsc::Sender<Arc<String>>,
    kick: mpsc::Sender<u16>,
}

/// Broadcast hub for one room.
pub struct Hub {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    /// Serializes fan-out so concurrent broadcasts cannot interleave
    /// their enqueues across subscribers.
    order: Mutex<()>,
    capacity: usize,
}

impl Hub {
    /// Create a hub whose per-session queues buffer up to `capacity`
    /// frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            order: Mutex::new(()),
            capacity,
        }
    }

    /// Add a session to the fan-out set.
    pub async fn attach(&self, client_id: Uuid) -> SessionQueues {
        let (frame_tx, frame_rx) = mpsc::channel(self.capacity);
        let (kick_tx, kick_rx) = mpsc::channel(1);
        self.subscribers.write().await.insert(
            client_id,
            Subscriber {
                frames: frame_tx,
                kick: kick_tx,
            },
        );
        SessionQueues {
            frames: frame_rx,
            kick: kick_rx,
        }
    }

    /// Remove a session. Idempotent.
    pub async fn detach(&self, client_id: Uuid) -> bool {
        self.subscribers.write().await.remove(&client_id).is_some()
    }

    /// Signal a session to close with `code`. The session's socket task
    /// observes the signal and runs the Closing procedure itself.
    pub async fn kick(&self, client_id: Uuid, code: u16) -> bool {
        let subscribers = self.subscribers.read().await;
        match subscribers.get(&client_id) {
            Some(sub) => {
                let _ = sub.kick.try_send(code);
                true
            }
            None => false,
        }
    }

    /// Deliver `frame` to every attached session except `exclude`.
    ///
    /// Returns the number of sessions the frame was enqueued to.
    /// Subscribers with a full queue are evicted with close 1013, which
    /// preserves the ordering contract for the survivors.
    pub async fn broadcast(
        &self,
        frame: &ServerFrame,
        exclude: Option<Uuid>,
    ) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(frame.encode()?);
        let mut delivered = 0;
        let mut laggards = Vec::new();
        {
            let _order = self.order.lock().await;
            // Snapshot the set so the subscriber lock is only held for
            // attach/detach, never during send.
            let targets: Vec<(Uuid, mpsc::Sender<Arc<String>>)> = {
                let subscribers = self.subscribers.read().await;
                subscribers
                    .iter()
                    .filter(|(client_id, _)| Some(**client_id) != exclude)
                    .map(|(client_id, sub)| (*client_id, sub.frames.clone()))
                    .collect()
            };
            for (client_id, tx) in targets {
                match tx.try_send(encoded.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => laggards.push(client_id),
                    // Receiver already dropped; session is tearing down.
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }
        for client_id in laggards {
            log::warn!("evicting laggard session {client_id}: outbound queue full");
            self.kick(client_id, close::TRY_AGAIN).await;
            self.detach(client_id).await;
        }
        Ok(delivered)
    }

    /// Deliver `frame` to a single session. Returns whether it was
    /// enqueued.
    pub async fn send_to(
        &self,
        client_id: Uuid,
        frame: &ServerFrame,
    ) -> Result<bool, ProtocolError> {
        let encoded = Arc::new(frame.encode()?);
        {
            let _order = self.order.lock().await;
            let subscribers = self.subscribers.read().await;
            let Some(sub) = subscribers.get(&client_id) else {
                return Ok(false);
            };
            match sub.frames.try_send(encoded) {
                Ok(()) => return Ok(true),
                Err(TrySendError::Closed(_)) => return Ok(false),
                Err(TrySendError::Full(_)) => {}
            }
        }
        log::warn!("evicting laggard session {client_id}: outbound queue full");
        self.kick(client_id, close::TRY_AGAIN).await;
        self.detach(client_id).await;
        Ok(false)
    }

    pub async fn count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn contains(&self, client_id: Uuid) -> bool {
        self.subscribers.read().await.contains_key(&client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn left(client_id: Uuid) -> ServerFrame {
        ServerFrame::UserLeft { client_id }
    }

    fn update(block: &str, owner: Option<Uuid>) -> ServerFrame {
        ServerFrame::LockUpdate {
            block_id: block.into(),
            owner,
        }
    }

    fn decode(frame: &Arc<String>) -> serde_json::Value {
        serde_json::from_str(frame).unwrap()
    }

    #[tokio::test]
    async fn test_attach_detach_counts() {
        let hub = Hub::new(16);
        let a = Uuid::new_v4();

        let _queues = hub.attach(a).await;
        assert_eq!(hub.count().await, 1);
        assert!(hub.contains(a).await);

        assert!(hub.detach(a).await);
        assert!(!hub.detach(a).await);
        assert_eq!(hub.count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_in_order() {
        let hub = Hub::new(16);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut qa = hub.attach(a).await;
        let mut qb = hub.attach(b).await;

        for i in 0..3 {
            let n = hub
                .broadcast(&update(&format!("b{i}"), Some(a)), None)
                .await
                .unwrap();
            assert_eq!(n, 2);
        }

        for q in [&mut qa, &mut qb] {
            for i in 0..3 {
                let frame = q.frames.recv().await.unwrap();
                assert_eq!(decode(&frame)["payload"]["blockId"], format!("b{i}"));
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let hub = Hub::new(16);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut qa = hub.attach(a).await;
        let mut qb = hub.attach(b).await;

        let n = hub.broadcast(&left(a), Some(a)).await.unwrap();
        assert_eq!(n, 1);

        assert!(qb.frames.recv().await.is_some());
        assert!(qa.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_targets_one_session() {
        let hub = Hub::new(16);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut qa = hub.attach(a).await;
        let mut qb = hub.attach(b).await;

        assert!(hub.send_to(a, &left(b)).await.unwrap());
        assert!(qa.frames.recv().await.is_some());
        assert!(qb.frames.try_recv().is_err());

        // Unknown target is a no-op.
        assert!(!hub.send_to(Uuid::new_v4(), &left(b)).await.unwrap());
    }

    #[tokio::test]
    async fn test_laggard_is_kicked_with_backpressure_code() {
        let hub = Hub::new(2);
        let slow = Uuid::new_v4();
        let fast = Uuid::new_v4();
        let mut q_slow = hub.attach(slow).await;
        let mut q_fast = hub.attach(fast).await;

        // Fill the slow queue without draining it.
        hub.broadcast(&update("b1", None), None).await.unwrap();
        hub.broadcast(&update("b2", None), None).await.unwrap();
        // Third frame overflows the slow subscriber.
        q_fast.frames.recv().await.unwrap();
        q_fast.frames.recv().await.unwrap();
        hub.broadcast(&update("b3", None), None).await.unwrap();

        assert_eq!(q_slow.kick.recv().await, Some(close::TRY_AGAIN));
        assert!(!hub.contains(slow).await);
        assert!(hub.contains(fast).await);

        // Survivor still saw every frame in order.
        let frame = q_fast.frames.recv().await.unwrap();
        assert_eq!(decode(&frame)["payload"]["blockId"], "b3");
    }

    #[tokio::test]
    async fn test_kick_signals_close_code() {
        let hub = Hub::new(4);
        let a = Uuid::new_v4();
        let mut qa = hub.attach(a).await;

        assert!(hub.kick(a, close::NORMAL).await);
        assert_eq!(qa.kick.recv().await, Some(close::NORMAL));
        assert!(!hub.kick(Uuid::new_v4(), close::NORMAL).await);
    }

    #[tokio::test]
    async fn test_broadcast_skips_dropped_receiver() {
        let hub = Hub::new(4);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let qa = hub.attach(a).await;
        let mut qb = hub.attach(b).await;
        drop(qa);

        let n = hub.broadcast(&update("b1", None), None).await.unwrap();
        assert_eq!(n, 1);
        assert!(qb.frames.recv().await.is_some());
    }
}
