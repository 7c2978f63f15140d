//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files. Every field has a
//! default so partial files are accepted.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{math::Vec3, state::Tolerance};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
    #[serde(default)]
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub interpolation: InterpolationConfig,
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub movement: MovementConfig,
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_tick_hz() -> u32 {
    64
}

fn default_player_name() -> String {
    "Player".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
            player_name: default_player_name(),
            prediction: PredictionConfig::default(),
            interpolation: InterpolationConfig::default(),
            authority: AuthorityConfig::default(),
            movement: MovementConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Length of one fixed simulation step in seconds.
    pub fn fixed_dt(&self) -> f32 {
        1.0 / self.tick_hz.max(1) as f32
    }
}

/// Client-side prediction and reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Ticks of commands and predicted states kept for reconciliation.
    /// Bounds the round trip that can still be reconciled (128 ticks is
    /// two seconds at 64 Hz). Oldest entries are dropped first.
    pub history_len: usize,
    /// Number of newest unacknowledged commands resent every tick.
    pub input_redundancy: usize,
    /// Position error (world units) accepted without correction.
    pub position_tolerance: f32,
    /// Rotation error (degrees) accepted without correction.
    pub rotation_tolerance_deg: f32,
    /// Velocity error (units/s) accepted without correction.
    pub velocity_tolerance: f32,
    /// Corrections whose position error exceeds this are shown as a teleport
    /// instead of being smoothed.
    pub snap_distance: f32,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            history_len: 128,
            input_redundancy: 4,
            position_tolerance: 0.05,
            rotation_tolerance_deg: 5.0,
            velocity_tolerance: 0.25,
            snap_distance: 2.0,
        }
    }
}

impl PredictionConfig {
    pub fn tolerance(&self) -> Tolerance {
        Tolerance {
            position: self.position_tolerance,
            rotation_deg: self.rotation_tolerance_deg,
            velocity: self.velocity_tolerance,
        }
    }
}

/// Observer-side snapshot interpolation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolationConfig {
    /// How far the playback clock trails the newest snapshot.
    pub delay_secs: f64,
    /// Maximum buffered snapshots per observed entity.
    pub buffer_len: usize,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            delay_secs: 0.1,
            buffer_len: 8,
        }
    }
}

/// Server-side command processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Maximum out-of-order commands buffered per entity.
    pub max_pending_commands: usize,
    /// Ticks to wait for a missing command before applying it as empty.
    pub gap_wait_ticks: u32,
    /// Maximum commands applied to one entity in a single server tick.
    pub max_catchup: usize,
    /// Ticks without any input before the entity is stepped with no command.
    pub idle_ticks_before_settle: u32,
    /// A full snapshot is sent at least every this many ticks; diffs between.
    pub full_snapshot_interval: u32,
    /// Snapshot history kept per entity for diff baselines.
    pub snapshot_history_len: usize,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            max_pending_commands: 64,
            gap_wait_ticks: 3,
            max_catchup: 4,
            idle_ticks_before_settle: 8,
            full_snapshot_interval: 1,
            snapshot_history_len: 32,
        }
    }
}

/// Character movement tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    /// Horizontal speed at full input, units/s.
    pub move_speed: f32,
    /// Vertical launch speed of a jump, units/s.
    pub jump_speed: f32,
    pub gravity: Vec3,
    /// Height of the ground plane.
    pub ground_height: f32,
    /// Horizontal speed above which reaching a grounded state emits a footstep.
    pub footstep_speed: f32,
    /// Exponential decay rate of the visual correction offset, per second.
    pub smoothing_decay: f32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            move_speed: 5.0,
            jump_speed: 6.0,
            gravity: Vec3::new(0.0, -9.81, 0.0),
            ground_height: 0.0,
            footstep_speed: 0.5,
            smoothing_decay: 10.0,
        }
    }
}
