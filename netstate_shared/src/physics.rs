//! Physics abstraction.
//!
//! The simulation talks to rigid bodies only through [`RigidBody`]. A real
//! engine would plug its own body type in; [`SimpleBody`] is a deterministic
//! point-mass integrator over a flat ground plane, enough to drive movement
//! on both peers.

use serde::{Deserialize, Serialize};

use crate::math::{Quat, Vec3};

/// Physics parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PhysicsConfig {
    pub gravity: Vec3,
    pub ground_height: f32,
    pub mass: f32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.81, 0.0),
            ground_height: 0.0,
            mass: 1.0,
        }
    }
}

/// Capability interface of a rigid body.
pub trait RigidBody: Send {
    fn position(&self) -> Vec3;
    fn set_position(&mut self, position: Vec3);
    fn rotation(&self) -> Quat;
    fn set_rotation(&mut self, rotation: Quat);
    fn velocity(&self) -> Vec3;
    fn set_velocity(&mut self, velocity: Vec3);
    fn angular_velocity(&self) -> Vec3;
    fn set_angular_velocity(&mut self, angular_velocity: Vec3);

    fn mass(&self) -> f32;

    fn is_kinematic(&self) -> bool;
    fn set_kinematic(&mut self, kinematic: bool);

    /// Accumulates a force applied over the next step.
    fn add_force(&mut self, force: Vec3);

    /// Moves to `target` with collision response.
    fn move_position(&mut self, target: Vec3);

    fn is_grounded(&self) -> bool;

    /// Integrates one step. Kinematic bodies do not move.
    fn step(&mut self, dt_sec: f32);
}

/// Deterministic point-mass body.
#[derive(Debug, Clone)]
pub struct SimpleBody {
    cfg: PhysicsConfig,
    position: Vec3,
    rotation: Quat,
    velocity: Vec3,
    angular_velocity: Vec3,
    force: Vec3,
    kinematic: bool,
}

impl SimpleBody {
    pub fn new(cfg: PhysicsConfig, position: Vec3) -> Self {
        let mut body = Self {
            cfg,
            position,
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            force: Vec3::ZERO,
            kinematic: false,
        };
        body.position = body.resolve_ground(position);
        body
    }

    fn resolve_ground(&self, p: Vec3) -> Vec3 {
        Vec3::new(p.x, p.y.max(self.cfg.ground_height), p.z)
    }
}

impl RigidBody for SimpleBody {
    fn position(&self) -> Vec3 {
        self.position
    }

    fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    fn rotation(&self) -> Quat {
        self.rotation
    }

    fn set_rotation(&mut self, rotation: Quat) {
        self.rotation = rotation;
    }

    fn velocity(&self) -> Vec3 {
        self.velocity
    }

    fn set_velocity(&mut self, velocity: Vec3) {
        self.velocity = velocity;
    }

    fn angular_velocity(&self) -> Vec3 {
        self.angular_velocity
    }

    fn set_angular_velocity(&mut self, angular_velocity: Vec3) {
        self.angular_velocity = angular_velocity;
    }

    fn mass(&self) -> f32 {
        self.cfg.mass
    }

    fn is_kinematic(&self) -> bool {
        self.kinematic
    }

    fn set_kinematic(&mut self, kinematic: bool) {
        self.kinematic = kinematic;
        if kinematic {
            self.force = Vec3::ZERO;
        }
    }

    fn add_force(&mut self, force: Vec3) {
        if !self.kinematic {
            self.force += force;
        }
    }

    fn move_position(&mut self, target: Vec3) {
        self.position = self.resolve_ground(target);
    }

    fn is_grounded(&self) -> bool {
        self.position.y <= self.cfg.ground_height + 1e-4
    }

    fn step(&mut self, dt_sec: f32) {
        if self.kinematic {
            return;
        }

        let accel = self.cfg.gravity + self.force * (1.0 / self.cfg.mass);
        self.force = Vec3::ZERO;
        self.velocity += accel * dt_sec;
        self.position += self.velocity * dt_sec;

        if self.position.y <= self.cfg.ground_height {
            self.position.y = self.cfg.ground_height;
            if self.velocity.y < 0.0 {
                self.velocity.y = 0.0;
            }
        }

        if self.angular_velocity.y != 0.0 {
            let yaw = self.rotation.yaw() + self.angular_velocity.y * dt_sec;
            self.rotation = Quat::from_yaw(yaw);
        }
    }
}
