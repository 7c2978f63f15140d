//! `netstate_server`
//!
//! Server-side systems:
//! - Fixed timestep simulation loop
//! - Per-entity command reordering and authoritative stepping
//! - Receives input batches
//! - Sends snapshots and diffs
//!
//! Networking model:
//! - TCP: handshake/control plane
//! - UDP: gameplay plane (inputs/snapshots)

pub mod authority;
pub mod server;

pub use authority::{AuthorityEntity, CommandQueue, Slot};
pub use server::GameServer;
