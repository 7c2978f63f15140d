//! Records of the character movement entity kind: input command, state
//! snapshot and snapshot diff, with their wire layouts.

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    math::{Quat, Vec3},
    state::{checksum, InputRecord, StateDiff, StateRecord, Tolerance},
    wire::{
        put_quat, put_vec3, read_f32, read_f64, read_quat, read_u32, read_u8, read_vec3,
        WireError, WireFormat,
    },
};

bitflags! {
    /// Button bits of a [`MoveInput`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Buttons: u8 {
        const JUMP = 1 << 0;
    }
}

/// One tick of movement input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveInput {
    pub command_number: u32,
    pub tick: u32,
    /// Raw strafe axis in `[-1, 1]`.
    pub move_x: f32,
    /// Raw forward axis in `[-1, 1]`.
    pub move_z: f32,
    /// Facing, radians around the up axis.
    pub yaw: f32,
    pub buttons: Buttons,
}

impl MoveInput {
    pub fn jump(&self) -> bool {
        self.buttons.contains(Buttons::JUMP)
    }
}

impl InputRecord for MoveInput {
    fn command_number(&self) -> u32 {
        self.command_number
    }

    fn tick(&self) -> u32 {
        self.tick
    }

    fn empty(command_number: u32, tick: u32) -> Self {
        Self {
            command_number,
            tick,
            move_x: 0.0,
            move_z: 0.0,
            yaw: 0.0,
            buttons: Buttons::empty(),
        }
    }
}

impl WireFormat for MoveInput {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.command_number);
        buf.put_u32_le(self.tick);
        buf.put_f32_le(self.move_x);
        buf.put_f32_le(self.move_z);
        buf.put_f32_le(self.yaw);
        buf.put_u8(self.buttons.bits());
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        let command_number = read_u32(buf, "input.command_number")?;
        let tick = read_u32(buf, "input.tick")?;
        let move_x = read_f32(buf, "input.move_x")?;
        let move_z = read_f32(buf, "input.move_z")?;
        let yaw = read_f32(buf, "input.yaw")?;
        let bits = read_u8(buf, "input.buttons")?;
        let buttons = Buttons::from_bits(bits).ok_or(WireError::InvalidFlags(bits))?;
        Ok(Self {
            command_number,
            tick,
            move_x,
            move_z,
            yaw,
            buttons,
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct StateFlags: u8 {
        const GROUNDED = 1 << 0;
    }
}

/// Full physical state of a character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveState {
    pub last_processed_command: u32,
    pub time: f64,
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
    pub flags: StateFlags,
    /// Jumps performed so far.
    pub jump_count: u32,
}

impl Default for MoveState {
    fn default() -> Self {
        Self {
            last_processed_command: 0,
            time: 0.0,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            flags: StateFlags::GROUNDED,
            jump_count: 0,
        }
    }
}

impl MoveState {
    pub fn grounded(&self) -> bool {
        self.flags.contains(StateFlags::GROUNDED)
    }
}

impl StateRecord for MoveState {
    fn last_processed_command(&self) -> u32 {
        self.last_processed_command
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn within_tolerance(&self, other: &Self, tolerance: &Tolerance) -> bool {
        self.position.distance(other.position) <= tolerance.position
            && self.rotation.angle_deg(other.rotation) <= tolerance.rotation_deg
            && self.velocity.distance(other.velocity) <= tolerance.velocity
            && self.flags == other.flags
            && self.jump_count == other.jump_count
    }

    fn position_error(&self, other: &Self) -> f32 {
        self.position.distance(other.position)
    }
}

impl WireFormat for MoveState {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.last_processed_command);
        buf.put_f64_le(self.time);
        put_vec3(buf, self.position);
        put_quat(buf, self.rotation);
        put_vec3(buf, self.velocity);
        put_vec3(buf, self.angular_velocity);
        buf.put_u8(self.flags.bits());
        buf.put_u32_le(self.jump_count);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        let last_processed_command = read_u32(buf, "state.last_processed_command")?;
        let time = read_f64(buf, "state.time")?;
        let position = read_vec3(buf, "state.position")?;
        let rotation = read_quat(buf, "state.rotation")?;
        let velocity = read_vec3(buf, "state.velocity")?;
        let angular_velocity = read_vec3(buf, "state.angular_velocity")?;
        let flags = read_state_flags(buf)?;
        let jump_count = read_u32(buf, "state.jump_count")?;
        Ok(Self {
            last_processed_command,
            time,
            position,
            rotation,
            velocity,
            angular_velocity,
            flags,
            jump_count,
        })
    }
}

fn read_state_flags(buf: &mut &[u8]) -> Result<StateFlags, WireError> {
    let bits = read_u8(buf, "state.flags")?;
    StateFlags::from_bits(bits).ok_or(WireError::InvalidFlags(bits))
}

bitflags! {
    /// Which fields a [`MoveDiff`] carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DiffFields: u8 {
        const COMMAND = 1 << 0;
        const TIME = 1 << 1;
        const POSITION = 1 << 2;
        const ROTATION = 1 << 3;
        const VELOCITY = 1 << 4;
        const ANGULAR_VELOCITY = 1 << 5;
        const FLAGS = 1 << 6;
        const JUMP_COUNT = 1 << 7;
    }
}

/// Changed fields of a [`MoveState`] relative to a base snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveDiff {
    pub base_time: f64,
    pub crc32: u32,
    pub fields: DiffFields,
    pub last_processed_command: u32,
    pub time: f64,
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
    pub flags: StateFlags,
    pub jump_count: u32,
}

impl StateDiff<MoveState> for MoveDiff {
    fn between(base: &MoveState, target: &MoveState) -> Self {
        let mut fields = DiffFields::empty();
        fields.set(
            DiffFields::COMMAND,
            base.last_processed_command != target.last_processed_command,
        );
        fields.set(DiffFields::TIME, base.time != target.time);
        fields.set(DiffFields::POSITION, base.position != target.position);
        fields.set(DiffFields::ROTATION, base.rotation != target.rotation);
        fields.set(DiffFields::VELOCITY, base.velocity != target.velocity);
        fields.set(
            DiffFields::ANGULAR_VELOCITY,
            base.angular_velocity != target.angular_velocity,
        );
        fields.set(DiffFields::FLAGS, base.flags != target.flags);
        fields.set(DiffFields::JUMP_COUNT, base.jump_count != target.jump_count);

        Self {
            base_time: base.time,
            crc32: checksum(target),
            fields,
            last_processed_command: target.last_processed_command,
            time: target.time,
            position: target.position,
            rotation: target.rotation,
            velocity: target.velocity,
            angular_velocity: target.angular_velocity,
            flags: target.flags,
            jump_count: target.jump_count,
        }
    }

    fn apply(&self, base: &MoveState) -> Result<MoveState, WireError> {
        if base.time != self.base_time {
            return Err(WireError::BaseMismatch {
                expected: self.base_time,
                actual: base.time,
            });
        }

        let mut out = base.clone();
        let f = self.fields;
        if f.contains(DiffFields::COMMAND) {
            out.last_processed_command = self.last_processed_command;
        }
        if f.contains(DiffFields::TIME) {
            out.time = self.time;
        }
        if f.contains(DiffFields::POSITION) {
            out.position = self.position;
        }
        if f.contains(DiffFields::ROTATION) {
            out.rotation = self.rotation;
        }
        if f.contains(DiffFields::VELOCITY) {
            out.velocity = self.velocity;
        }
        if f.contains(DiffFields::ANGULAR_VELOCITY) {
            out.angular_velocity = self.angular_velocity;
        }
        if f.contains(DiffFields::FLAGS) {
            out.flags = self.flags;
        }
        if f.contains(DiffFields::JUMP_COUNT) {
            out.jump_count = self.jump_count;
        }

        let actual = checksum(&out);
        if actual != self.crc32 {
            return Err(WireError::ChecksumMismatch {
                expected: self.crc32,
                actual,
            });
        }
        Ok(out)
    }

    fn base_time(&self) -> f64 {
        self.base_time
    }
}

impl WireFormat for MoveDiff {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_f64_le(self.base_time);
        buf.put_u32_le(self.crc32);
        buf.put_u8(self.fields.bits());
        let f = self.fields;
        if f.contains(DiffFields::COMMAND) {
            buf.put_u32_le(self.last_processed_command);
        }
        if f.contains(DiffFields::TIME) {
            buf.put_f64_le(self.time);
        }
        if f.contains(DiffFields::POSITION) {
            put_vec3(buf, self.position);
        }
        if f.contains(DiffFields::ROTATION) {
            put_quat(buf, self.rotation);
        }
        if f.contains(DiffFields::VELOCITY) {
            put_vec3(buf, self.velocity);
        }
        if f.contains(DiffFields::ANGULAR_VELOCITY) {
            put_vec3(buf, self.angular_velocity);
        }
        if f.contains(DiffFields::FLAGS) {
            buf.put_u8(self.flags.bits());
        }
        if f.contains(DiffFields::JUMP_COUNT) {
            buf.put_u32_le(self.jump_count);
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        let base_time = read_f64(buf, "diff.base_time")?;
        let crc32 = read_u32(buf, "diff.crc32")?;
        // Every bit of the mask is defined, so any value is valid.
        let fields = DiffFields::from_bits_retain(read_u8(buf, "diff.fields")?);

        // Absent fields stay at neutral values; `apply` never reads them.
        let mut diff = MoveDiff {
            base_time,
            crc32,
            fields,
            last_processed_command: 0,
            time: 0.0,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            flags: StateFlags::empty(),
            jump_count: 0,
        };
        if fields.contains(DiffFields::COMMAND) {
            diff.last_processed_command = read_u32(buf, "diff.last_processed_command")?;
        }
        if fields.contains(DiffFields::TIME) {
            diff.time = read_f64(buf, "diff.time")?;
        }
        if fields.contains(DiffFields::POSITION) {
            diff.position = read_vec3(buf, "diff.position")?;
        }
        if fields.contains(DiffFields::ROTATION) {
            diff.rotation = read_quat(buf, "diff.rotation")?;
        }
        if fields.contains(DiffFields::VELOCITY) {
            diff.velocity = read_vec3(buf, "diff.velocity")?;
        }
        if fields.contains(DiffFields::ANGULAR_VELOCITY) {
            diff.angular_velocity = read_vec3(buf, "diff.angular_velocity")?;
        }
        if fields.contains(DiffFields::FLAGS) {
            diff.flags = read_state_flags(buf)?;
        }
        if fields.contains(DiffFields::JUMP_COUNT) {
            diff.jump_count = read_u32(buf, "diff.jump_count")?;
        }
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> MoveState {
        MoveState {
            last_processed_command: 42,
            time: 0.65625,
            position: Vec3::new(1.5, 0.25, -3.0),
            rotation: Quat::from_yaw(0.7),
            velocity: Vec3::new(5.0, -1.2, 0.0),
            angular_velocity: Vec3::new(0.0, 0.3, 0.0),
            flags: StateFlags::empty(),
            jump_count: 3,
        }
    }

    #[test]
    fn state_roundtrip_is_bit_exact() {
        let states = [
            MoveState::default(),
            sample_state(),
            MoveState {
                position: Vec3::new(f32::MAX, f32::MIN_POSITIVE, -0.0),
                time: 1e9,
                ..sample_state()
            },
        ];
        for s in states {
            let bytes = s.to_bytes();
            assert_eq!(bytes.len(), 69);
            let back = MoveState::from_bytes(&bytes).unwrap();
            assert_eq!(back.to_bytes(), bytes);
            assert_eq!(back, s);
        }
    }

    #[test]
    fn truncated_state_is_rejected() {
        let bytes = sample_state().to_bytes();
        for cut in [0, 4, 30, 68] {
            assert!(matches!(
                MoveState::from_bytes(&bytes[..cut]),
                Err(WireError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn input_layout() {
        let input = MoveInput {
            command_number: 7,
            tick: 9,
            move_x: 0.0,
            move_z: 1.0,
            yaw: 0.0,
            buttons: Buttons::JUMP,
        };
        let bytes = input.to_bytes();
        assert_eq!(bytes.len(), 21);
        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &9u32.to_le_bytes());
        assert_eq!(MoveInput::from_bytes(&bytes).unwrap(), input);
    }

    #[test]
    fn unknown_button_bits_are_rejected() {
        let mut bytes = MoveInput::empty(1, 1).to_bytes().to_vec();
        bytes[20] = 0x80;
        assert_eq!(
            MoveInput::from_bytes(&bytes),
            Err(WireError::InvalidFlags(0x80))
        );
    }

    #[test]
    fn tolerance_boundaries() {
        let tol = Tolerance::default();
        let a = sample_state();

        let mut b = a.clone();
        b.rotation = Quat::from_yaw(0.7 + 4.0f32.to_radians());
        assert!(a.within_tolerance(&b, &tol));

        b.rotation = Quat::from_yaw(0.7 + 6.0f32.to_radians());
        assert!(!a.within_tolerance(&b, &tol));

        let mut c = a.clone();
        c.position.x += tol.position * 0.5;
        assert!(a.within_tolerance(&c, &tol));
        c.position.x += 1.0;
        assert!(!a.within_tolerance(&c, &tol));

        let mut d = a.clone();
        d.jump_count += 1;
        assert!(!a.within_tolerance(&d, &tol));
    }

    #[test]
    fn diff_rebuilds_target_and_carries_only_changes() {
        let base = sample_state();
        let mut target = base.clone();
        target.time += 1.0 / 64.0;
        target.position.x += 0.1;
        target.last_processed_command += 1;

        let diff = MoveDiff::between(&base, &target);
        assert_eq!(
            diff.fields,
            DiffFields::COMMAND | DiffFields::TIME | DiffFields::POSITION
        );

        let decoded = MoveDiff::from_bytes(&diff.to_bytes()).unwrap();
        assert_eq!(decoded.apply(&base).unwrap(), target);
        assert!(decoded.to_bytes().len() < target.to_bytes().len());
    }

    #[test]
    fn diff_rejects_wrong_base() {
        let base = sample_state();
        let mut target = base.clone();
        target.time += 0.5;
        let diff = MoveDiff::between(&base, &target);

        let mut other = base.clone();
        other.time += 0.25;
        assert!(matches!(
            diff.apply(&other),
            Err(WireError::BaseMismatch { .. })
        ));

        // Same time but different content: the checksum catches it.
        let mut drifted = base.clone();
        drifted.velocity.x += 1.0;
        assert!(matches!(
            diff.apply(&drifted),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }
}
