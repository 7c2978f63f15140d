//! Data model shared by every networked entity kind.
//!
//! An entity kind supplies three records:
//! - an input command produced once per tick by the owning peer,
//! - a full state snapshot produced by whoever simulates the entity,
//! - an optional diff between two snapshots.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::wire::{WireError, WireFormat};

/// Command number meaning "no command processed yet". Real commands start at 1.
pub const NO_COMMAND: u32 = 0;

/// Per-tick input. Immutable once created.
pub trait InputRecord: Clone + Debug + Send + Sync + WireFormat + 'static {
    /// Strictly increasing per owner.
    fn command_number(&self) -> u32;

    /// Simulation tick the command was generated for.
    fn tick(&self) -> u32;

    /// Same payload with no player intent, applied when the command itself was
    /// lost in transit.
    fn empty(command_number: u32, tick: u32) -> Self;
}

/// Full point-in-time state of an entity.
pub trait StateRecord: Clone + Debug + PartialEq + Send + Sync + WireFormat + 'static {
    /// Newest command applied before this state was captured.
    fn last_processed_command(&self) -> u32;

    /// Simulated time of the capture, seconds.
    fn time(&self) -> f64;

    /// Margin-tolerant equality.
    fn within_tolerance(&self, other: &Self, tolerance: &Tolerance) -> bool;

    /// Positional distance between two states, world units.
    fn position_error(&self, other: &Self) -> f32;
}

/// Delta between a base snapshot and a newer one, with an integrity checksum
/// of the full target state.
pub trait StateDiff<S: StateRecord>: Clone + Debug + Send + Sync + WireFormat + 'static {
    fn between(base: &S, target: &S) -> Self;

    /// Rebuilds the target. Fails if `base` is not the snapshot the diff was
    /// taken against or if the result does not match the checksum.
    fn apply(&self, base: &S) -> Result<S, WireError>;

    fn base_time(&self) -> f64;
}

/// Thresholds under which two states count as equal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub position: f32,
    pub rotation_deg: f32,
    pub velocity: f32,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            position: 0.05,
            rotation_deg: 5.0,
            velocity: 0.25,
        }
    }
}

/// CRC-32 (IEEE) of a record's wire encoding.
pub fn checksum<T: WireFormat>(value: &T) -> u32 {
    crc32fast::hash(&value.to_bytes())
}
