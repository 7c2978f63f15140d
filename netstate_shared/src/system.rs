//! Tick-driven simulation contract.
//!
//! Every networked entity kind implements [`NetworkedStateSystem`]. The
//! prediction controller, the observer interpolator and the authority driver
//! are generic over it and never know the concrete physics.

use serde::{Deserialize, Serialize};

use crate::state::{InputRecord, StateDiff, StateRecord};

/// Role of the local peer for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkMode {
    /// Owns the entity's input; predicts locally.
    Input,
    /// Applies commands; source of truth.
    Authority,
    /// Only receives snapshots and interpolates them.
    Observer,
}

/// Deterministic fixed-step simulation of one entity.
pub trait NetworkedStateSystem: Send {
    type State: StateRecord;
    type Diff: StateDiff<Self::State>;
    type Input: InputRecord;

    fn mode(&self) -> NetworkMode;

    /// Switches role and the body's kinematic flag to match. Idempotent.
    fn set_mode(&mut self, mode: NetworkMode);

    /// Samples the current input intent into a command. Clears edge-triggered
    /// flags that the command consumed.
    fn get_command(&mut self, command_number: u32, tick: u32) -> Self::Input;

    /// Advances one fixed step. `None` means no player input this tick.
    /// `replay` suppresses one-shot effects that already fired.
    fn tick(&mut self, command: Option<&Self::Input>, time: f64, replay: bool);

    fn get_current_state(&self, command_number: u32, time: f64) -> Self::State;

    /// Hard overwrite of the live state.
    fn set_current_state(&mut self, state: &Self::State);

    /// Visual-only blend between two snapshots; `delta` in `[0, 1]`.
    fn interpolate(&mut self, delta: f64, older: &Self::State, newer: &Self::State);

    /// Called once when interpolation crosses `state`.
    fn interpolate_reached_state(&mut self, state: &Self::State);

    /// Instant teleport.
    fn snap_to(&mut self, state: &Self::State) {
        self.set_current_state(state);
    }

    /// Continuous correction. Defaults to a snap.
    fn move_to(&mut self, state: &Self::State) {
        self.set_current_state(state);
    }
}
