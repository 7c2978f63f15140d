//! Input handling.
//!
//! In a real engine this would integrate with windowing, raw mouse/keyboard
//! and action bindings. Here an [`InputDevice`] is polled once per tick and
//! turned into a [`MoveIntent`] that the owned character latches.

use std::collections::VecDeque;

use netstate_shared::{
    input::{Axis, InputDevice, Key},
    movement::MoveIntent,
};

/// User input state at a moment in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    pub forward: f32,
    pub right: f32,
    pub yaw: f32,
    pub jump: bool,
}

impl InputDevice for InputState {
    fn get_axis_raw(&self, axis: Axis) -> f32 {
        match axis {
            Axis::Horizontal => self.right,
            Axis::Vertical => self.forward,
            Axis::Yaw => self.yaw,
        }
    }

    fn key_down(&self, key: Key) -> bool {
        match key {
            Key::Jump => self.jump,
        }
    }
}

/// Plays back a fixed sequence of input frames, one per poll, then repeats
/// the last frame with the jump key released.
#[derive(Debug, Clone, Default)]
pub struct ScriptedInput {
    frames: VecDeque<InputState>,
    current: InputState,
}

impl ScriptedInput {
    pub fn new(frames: impl IntoIterator<Item = InputState>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            current: InputState::default(),
        }
    }

    /// Moves to the next frame.
    pub fn advance(&mut self) -> InputState {
        self.current = match self.frames.pop_front() {
            Some(frame) => frame,
            None => InputState {
                jump: false,
                ..self.current
            },
        };
        self.current
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl InputDevice for ScriptedInput {
    fn get_axis_raw(&self, axis: Axis) -> f32 {
        self.current.get_axis_raw(axis)
    }

    fn key_down(&self, key: Key) -> bool {
        self.current.key_down(key)
    }
}

/// Polls `device` once.
pub fn sample_intent(device: &dyn InputDevice) -> MoveIntent {
    MoveIntent {
        move_x: device.get_axis_raw(Axis::Horizontal).clamp(-1.0, 1.0),
        move_z: device.get_axis_raw(Axis::Vertical).clamp(-1.0, 1.0),
        yaw: device.get_axis_raw(Axis::Yaw),
        jump: device.key_down(Key::Jump),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_clamps_axes() {
        let state = InputState {
            forward: 3.0,
            right: -2.0,
            yaw: 4.0,
            jump: true,
        };
        let intent = sample_intent(&state);
        assert_eq!(intent.move_z, 1.0);
        assert_eq!(intent.move_x, -1.0);
        assert_eq!(intent.yaw, 4.0);
        assert!(intent.jump);
    }

    #[test]
    fn scripted_input_releases_jump_after_script_ends() {
        let mut input = ScriptedInput::new([InputState {
            forward: 1.0,
            jump: true,
            ..InputState::default()
        }]);
        assert!(input.advance().jump);
        assert_eq!(input.remaining(), 0);
        let held = input.advance();
        assert!(!held.jump);
        assert_eq!(held.forward, 1.0);
    }
}
