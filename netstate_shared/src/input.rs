//! Input device capability.
//!
//! Polled once per tick, and only on the peer that owns an entity's input.

use serde::{Deserialize, Serialize};

/// Analog axes, each in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Horizontal,
    Vertical,
    /// Absolute look yaw in radians. Not clamped.
    Yaw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    Jump,
}

pub trait InputDevice {
    /// Unsmoothed axis value.
    fn get_axis_raw(&self, axis: Axis) -> f32;

    /// True only on the poll where the key went down.
    fn key_down(&self, key: Key) -> bool;
}

impl<T: InputDevice + ?Sized> InputDevice for &T {
    fn get_axis_raw(&self, axis: Axis) -> f32 {
        (**self).get_axis_raw(axis)
    }

    fn key_down(&self, key: Key) -> bool {
        (**self).key_down(key)
    }
}
