//! Periodic eviction of participants whose connection has gone quiet.
//!
//! The reaper never talks to sockets directly: it synthesizes a
//! disconnect by kicking the session (so its socket task closes the
//! transport) and running the same Closing procedure the session itself
//! would run. Both paths are idempotent, so racing the session's own
//! teardown is harmless.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::protocol::close;
use crate::registry::RoomRegistry;
use crate::server::ServerConfig;
use crate::session;

/// Spawn the reaper task. It sweeps every `reaper_interval` until the
/// process shuts down.
pub fn spawn(registry: Arc<RoomRegistry>, config: Arc<ServerConfig>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.reaper_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = sweep(&registry, &config).await;
            if evicted > 0 {
                log::info!("reaper evicted {evicted} stale participant(s)");
            }
        }
    })
}

/// One sweep over every room. Returns the number of evicted participants.
pub async fn sweep(registry: &RoomRegistry, config: &ServerConfig) -> usize {
    let Some(cutoff) = Instant::now().checked_sub(config.user_ttl) else {
        return 0;
    };
    let mut evicted = 0;
    for room in registry.rooms().await {
        for client_id in room.presence.stale_since(cutoff).await {
            log::info!("reaping stale participant {client_id} from room {}", room.id);
            room.hub.kick(client_id, close::NORMAL).await;
            session::finish_session(&room, client_id).await;
            evicted += 1;
        }
    }
    evicted
}
