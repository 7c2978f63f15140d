//! Character movement: the reference [`NetworkedStateSystem`].
//!
//! Horizontal velocity follows the input axes directly, jumps launch with a
//! fixed vertical speed while grounded, and gravity is left to the rigid body.
//! Visual state (the render pose) is kept apart from simulation state so that
//! interpolation and correction smoothing never feed back into physics.

use crate::{
    config::{EngineConfig, MovementConfig},
    event::EffectQueue,
    math::{Quat, Vec3},
    move_state::{Buttons, MoveDiff, MoveInput, MoveState, StateFlags},
    physics::{PhysicsConfig, RigidBody, SimpleBody},
    system::{NetworkMode, NetworkedStateSystem},
};

/// Visual offsets smaller than this are dropped.
const MIN_VISUAL_OFFSET: f32 = 1e-3;

/// Sampled input intent, latched between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MoveIntent {
    pub move_x: f32,
    pub move_z: f32,
    pub yaw: f32,
    pub jump: bool,
}

/// One-shot presentation effects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MovementEffect {
    Jumped { command_number: u32 },
    Footstep { time: f64 },
}

/// Where the entity is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderPose {
    pub position: Vec3,
    pub rotation: Quat,
}

pub struct CharacterMovement<B: RigidBody> {
    cfg: MovementConfig,
    dt_sec: f32,
    body: B,
    mode: NetworkMode,
    intent: MoveIntent,
    jump_latched: bool,
    jump_count: u32,
    render: RenderPose,
    visual_offset: Vec3,
    effects: EffectQueue<MovementEffect>,
}

impl CharacterMovement<SimpleBody> {
    /// Creates a character on a [`SimpleBody`] configured from `cfg`.
    pub fn spawn(cfg: &EngineConfig, position: Vec3) -> Self {
        let physics = PhysicsConfig {
            gravity: cfg.movement.gravity,
            ground_height: cfg.movement.ground_height,
            ..PhysicsConfig::default()
        };
        Self::new(
            cfg.movement.clone(),
            cfg.fixed_dt(),
            SimpleBody::new(physics, position),
        )
    }
}

impl<B: RigidBody> CharacterMovement<B> {
    pub fn new(cfg: MovementConfig, dt_sec: f32, body: B) -> Self {
        let render = RenderPose {
            position: body.position(),
            rotation: body.rotation(),
        };
        Self {
            cfg,
            dt_sec,
            body,
            mode: NetworkMode::Authority,
            intent: MoveIntent::default(),
            jump_latched: false,
            jump_count: 0,
            render,
            visual_offset: Vec3::ZERO,
            effects: EffectQueue::default(),
        }
    }

    /// Latches the latest sampled input. A jump press stays latched until a
    /// command consumes it, so a press between ticks is never lost.
    pub fn set_intent(&mut self, intent: MoveIntent) {
        self.intent = intent;
        if intent.jump {
            self.jump_latched = true;
        }
    }

    pub fn body(&self) -> &B {
        &self.body
    }

    pub fn render_pose(&self) -> RenderPose {
        self.render
    }

    pub fn visual_offset(&self) -> Vec3 {
        self.visual_offset
    }

    pub fn drain_effects(&mut self) -> Vec<MovementEffect> {
        self.effects.drain()
    }

    fn wish_velocity(&self, cmd: &MoveInput) -> Vec3 {
        let local = Vec3::new(cmd.move_x, 0.0, cmd.move_z).clamp_len(1.0);
        let (sin, cos) = cmd.yaw.sin_cos();
        Vec3::new(
            local.x * cos + local.z * sin,
            0.0,
            -local.x * sin + local.z * cos,
        ) * self.cfg.move_speed
    }

    /// Force that changes the horizontal velocity to `target` in one step.
    fn steer_towards(&mut self, target: Vec3) {
        let dv = target - self.body.velocity().horizontal();
        let scale = self.body.mass() / self.dt_sec;
        self.body.add_force(dv * scale);
    }

    fn refresh_render(&mut self) {
        if self.mode == NetworkMode::Observer {
            return;
        }
        self.render = RenderPose {
            position: self.body.position() + self.visual_offset,
            rotation: self.body.rotation(),
        };
    }

    fn decay_visual_offset(&mut self) {
        if self.visual_offset == Vec3::ZERO {
            return;
        }
        let factor = (-self.cfg.smoothing_decay * self.dt_sec).exp();
        self.visual_offset = self.visual_offset * factor;
        if self.visual_offset.len() < MIN_VISUAL_OFFSET {
            self.visual_offset = Vec3::ZERO;
        }
    }

    fn write_state(&mut self, state: &MoveState) {
        self.body.set_rotation(state.rotation);
        if !self.body.is_kinematic() {
            self.body.set_velocity(state.velocity);
            self.body.set_angular_velocity(state.angular_velocity);
        }
        self.jump_count = state.jump_count;
    }
}

impl<B: RigidBody> NetworkedStateSystem for CharacterMovement<B> {
    type State = MoveState;
    type Diff = MoveDiff;
    type Input = MoveInput;

    fn mode(&self) -> NetworkMode {
        self.mode
    }

    fn set_mode(&mut self, mode: NetworkMode) {
        self.mode = mode;
        self.body.set_kinematic(mode == NetworkMode::Observer);
        if mode != NetworkMode::Input {
            self.jump_latched = false;
        }
    }

    fn get_command(&mut self, command_number: u32, tick: u32) -> MoveInput {
        let mut buttons = Buttons::empty();
        if self.jump_latched {
            buttons |= Buttons::JUMP;
            self.jump_latched = false;
        }
        MoveInput {
            command_number,
            tick,
            move_x: self.intent.move_x.clamp(-1.0, 1.0),
            move_z: self.intent.move_z.clamp(-1.0, 1.0),
            yaw: self.intent.yaw,
            buttons,
        }
    }

    fn tick(&mut self, command: Option<&MoveInput>, _time: f64, replay: bool) {
        self.effects.set_suppressed(replay);

        match command {
            Some(cmd) => {
                let wish = self.wish_velocity(cmd);
                self.steer_towards(wish);
                if cmd.jump() && self.body.is_grounded() {
                    let impulse = self.cfg.jump_speed * self.body.mass() / self.dt_sec;
                    self.body.add_force(Vec3::UP * impulse);
                    self.jump_count += 1;
                    self.effects.emit(MovementEffect::Jumped {
                        command_number: cmd.command_number,
                    });
                }
                self.body.set_rotation(Quat::from_yaw(cmd.yaw));
            }
            None => {
                // No intent: come to rest on the ground, keep falling in the air.
                if self.body.is_grounded() {
                    self.steer_towards(Vec3::ZERO);
                }
            }
        }

        self.body.step(self.dt_sec);
        self.effects.set_suppressed(false);

        if !replay {
            self.decay_visual_offset();
        }
        self.refresh_render();
    }

    fn get_current_state(&self, command_number: u32, time: f64) -> MoveState {
        let mut flags = StateFlags::empty();
        flags.set(StateFlags::GROUNDED, self.body.is_grounded());
        MoveState {
            last_processed_command: command_number,
            time,
            position: self.body.position(),
            rotation: self.body.rotation(),
            velocity: self.body.velocity(),
            angular_velocity: self.body.angular_velocity(),
            flags,
            jump_count: self.jump_count,
        }
    }

    fn set_current_state(&mut self, state: &MoveState) {
        self.body.set_position(state.position);
        self.write_state(state);
        self.refresh_render();
    }

    fn interpolate(&mut self, delta: f64, older: &MoveState, newer: &MoveState) {
        let t = delta.clamp(0.0, 1.0) as f32;
        self.render = RenderPose {
            position: older.position.lerp(newer.position, t),
            rotation: older.rotation.nlerp(newer.rotation, t),
        };
    }

    fn interpolate_reached_state(&mut self, state: &MoveState) {
        if state.grounded() && state.velocity.horizontal().len() >= self.cfg.footstep_speed {
            self.effects.emit(MovementEffect::Footstep { time: state.time });
        }
    }

    fn snap_to(&mut self, state: &MoveState) {
        self.visual_offset = Vec3::ZERO;
        self.set_current_state(state);
    }

    fn move_to(&mut self, state: &MoveState) {
        let drawn_at = self.body.position() + self.visual_offset;
        self.body.move_position(state.position);
        self.write_state(state);
        self.visual_offset = drawn_at - self.body.position();
        if self.visual_offset.len() < MIN_VISUAL_OFFSET {
            self.visual_offset = Vec3::ZERO;
        }
        self.refresh_render();
    }
}
