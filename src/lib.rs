//! # blocksync — room session coordinator for shared block workspaces
//!
//! Multiple participants connected to the same room concurrently edit a
//! workspace of connected blocks. The server serializes conflicting edits
//! through per-block leases, fans applied commits out in order, and keeps
//! a consistent shared view.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐
//!             ├── RoomCtx (room_id) ── Hub (ordered fan-out)
//! Client B ──┘         │
//!                      ├── LeaseStore    (block_id → owner, TTL)
//!                      ├── PresenceStore (client_id → nickname/color/last_seen)
//!                      └── SnapshotStore (latest workspace payload)
//!
//! Reaper ── every REAPER_INTERVAL ── synthesizes disconnects for
//!           participants whose last_seen exceeds USER_TTL
//! ```
//!
//! Each connection runs one session task that owns the socket, drains its
//! bounded outbound queue, and on any termination cause runs the Closing
//! procedure: release leases, detach from the hub, drop presence.
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames (`{"t": …, "payload": …}`)
//! - [`lease`] — per-room lease table with TTL and owner index
//! - [`presence`] — per-room participant set
//! - [`snapshot`] — last-writer-wins workspace payload
//! - [`broadcast`] — per-room hub with ordered fan-out and backpressure
//! - [`registry`] — room registry and room record store
//! - [`session`] — wire protocol state machine
//! - [`reaper`] — stale-participant eviction
//! - [`server`] — configuration and accept loop

pub mod protocol;
pub mod lease;
pub mod presence;
pub mod snapshot;
pub mod broadcast;
pub mod registry;
pub mod session;
pub mod reaper;
pub mod server;

// Re-exports for convenience
pub use protocol::{close, ClientFrame, ProtocolError, ServerFrame, UserEntry};
pub use lease::{AcquireOutcome, BlockId, Conflict, LeaseStore, ReleaseOutcome};
pub use presence::{Participant, PresenceStore, DEFAULT_PALETTE};
pub use snapshot::{SnapshotError, SnapshotStore};
pub use broadcast::{Hub, SessionQueues};
pub use registry::{RecordError, RecordStore, RoomCtx, RoomMeta, RoomRegistry};
pub use server::{CollabServer, ServerConfig, ServerStats};
