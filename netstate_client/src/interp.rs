//! Interpolation.
//!
//! The server sends discrete snapshots at tick boundaries. Observers render
//! a playback clock that trails the newest snapshot by a fixed delay and blend
//! between the pair of buffered snapshots around it.

use std::collections::VecDeque;

use netstate_shared::{
    config::InterpolationConfig,
    state::StateRecord,
    system::NetworkedStateSystem,
};
use tracing::trace;

/// Buffered snapshot history for one observed entity.
#[derive(Debug, Clone)]
pub struct Interpolator<St> {
    history: VecDeque<St>,
    max: usize,
    delay: f64,
    /// Playback time; `None` until the first snapshot arrives.
    clock: Option<f64>,
    /// Time of the last snapshot `interpolate_reached_state` fired for.
    last_reached: Option<f64>,
}

impl<St: StateRecord> Interpolator<St> {
    pub fn new(cfg: &InterpolationConfig) -> Self {
        Self {
            history: VecDeque::new(),
            max: cfg.buffer_len.max(2),
            delay: cfg.delay_secs.max(0.0),
            clock: None,
            last_reached: None,
        }
    }

    /// Buffers a snapshot. Snapshots older than the newest buffered one are
    /// rejected; returns whether `state` was kept.
    pub fn push(&mut self, state: St) -> bool {
        if let Some(newest) = self.history.back() {
            if state.time() < newest.time() {
                trace!(
                    time = state.time(),
                    newest = newest.time(),
                    "Out-of-order snapshot"
                );
                return false;
            }
            if state.time() == newest.time() {
                // Same tick resent; keep the latest copy.
                self.history.pop_back();
            }
        }
        if self.clock.is_none() {
            self.clock = Some(state.time() - self.delay);
        }
        self.history.push_back(state);
        while self.history.len() > self.max {
            self.history.pop_front();
        }
        true
    }

    /// Returns the number of buffered snapshots.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Returns true if no snapshots are buffered.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn render_time(&self) -> Option<f64> {
        self.clock
    }

    pub fn newest(&self) -> Option<&St> {
        self.history.back()
    }

    /// Moves the playback clock by `dt` seconds, fires
    /// `interpolate_reached_state` once for every snapshot the clock passed
    /// and writes the blended render pose.
    pub fn advance<S>(&mut self, system: &mut S, dt: f64)
    where
        S: NetworkedStateSystem<State = St>,
    {
        let Some(mut now) = self.clock else {
            return;
        };
        now += dt;

        // Never run past the newest snapshot.
        if let Some(newest) = self.history.back() {
            if now > newest.time() {
                now = newest.time();
            }
        }
        self.clock = Some(now);

        while self.history.len() >= 2 && now >= self.history[1].time() {
            self.reach(system, 1);
            if self.history.len() > 2 {
                self.history.pop_front();
            } else {
                break;
            }
        }

        if self.history.len() == 1 && now >= self.history[0].time() {
            self.reach(system, 0);
        }

        match (self.history.front(), self.history.get(1)) {
            (Some(older), Some(newer)) => {
                let span = newer.time() - older.time();
                let delta = if span > 0.0 {
                    ((now - older.time()) / span).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                system.interpolate(delta, older, newer);
            }
            (Some(only), None) => system.interpolate(1.0, only, only),
            _ => {}
        }
    }

    /// Drops all snapshots and restarts the clock on the next push.
    pub fn clear(&mut self) {
        self.history.clear();
        self.clock = None;
        self.last_reached = None;
    }

    fn reach<S>(&mut self, system: &mut S, index: usize)
    where
        S: NetworkedStateSystem<State = St>,
    {
        let state = &self.history[index];
        let t = state.time();
        if self.last_reached.map_or(true, |last| t > last) {
            system.interpolate_reached_state(state);
            self.last_reached = Some(t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netstate_shared::{
        config::EngineConfig,
        math::Vec3,
        move_state::{MoveState, StateFlags},
        movement::{CharacterMovement, MovementEffect},
        physics::{RigidBody, SimpleBody},
        system::NetworkMode,
    };

    fn observer() -> CharacterMovement<SimpleBody> {
        let mut c = CharacterMovement::spawn(&EngineConfig::default(), Vec3::ZERO);
        c.set_mode(NetworkMode::Observer);
        c
    }

    fn snap(time: f64, x: f32) -> MoveState {
        MoveState {
            time,
            position: Vec3::new(x, 0.0, 0.0),
            velocity: Vec3::new(10.0, 0.0, 0.0),
            flags: StateFlags::GROUNDED,
            ..MoveState::default()
        }
    }

    fn no_delay() -> InterpolationConfig {
        InterpolationConfig {
            delay_secs: 0.0,
            ..InterpolationConfig::default()
        }
    }

    fn footsteps(c: &mut CharacterMovement<SimpleBody>) -> usize {
        c.drain_effects()
            .into_iter()
            .filter(|e| matches!(e, MovementEffect::Footstep { .. }))
            .count()
    }

    #[test]
    fn halfway_between_two_snapshots() {
        let mut c = observer();
        let mut interp = Interpolator::new(&no_delay());
        assert!(interp.push(snap(0.0, 0.0)));
        assert!(interp.push(snap(1.0, 10.0)));

        interp.advance(&mut c, 0.5);
        assert_eq!(c.render_pose().position, Vec3::new(5.0, 0.0, 0.0));
        assert_eq!(footsteps(&mut c), 0);
    }

    #[test]
    fn reached_state_fires_once_per_snapshot() {
        let mut c = observer();
        let mut interp = Interpolator::new(&no_delay());
        interp.push(snap(0.0, 0.0));
        interp.push(snap(1.0, 10.0));

        interp.advance(&mut c, 0.9);
        assert_eq!(footsteps(&mut c), 0);
        interp.advance(&mut c, 0.2);
        assert_eq!(footsteps(&mut c), 1);
        assert_eq!(c.render_pose().position, Vec3::new(10.0, 0.0, 0.0));

        // Clock is held at the newest snapshot; no repeat.
        interp.advance(&mut c, 0.5);
        interp.advance(&mut c, 0.5);
        assert_eq!(footsteps(&mut c), 0);

        interp.push(snap(2.0, 20.0));
        interp.advance(&mut c, 1.0);
        assert_eq!(footsteps(&mut c), 1);
    }

    #[test]
    fn large_step_crosses_several_snapshots() {
        let mut c = observer();
        let mut interp = Interpolator::new(&no_delay());
        for i in 0..5 {
            interp.push(snap(i as f64 * 0.1, i as f32));
        }
        interp.advance(&mut c, 0.35);
        assert_eq!(footsteps(&mut c), 3);
        let x = c.render_pose().position.x;
        assert!((x - 3.5).abs() < 1e-4, "x = {x}");
    }

    #[test]
    fn older_snapshots_are_rejected() {
        let mut interp = Interpolator::<MoveState>::new(&no_delay());
        assert!(interp.push(snap(1.0, 0.0)));
        assert!(!interp.push(snap(0.5, 0.0)));
        assert!(interp.push(snap(1.0, 1.0)));
        assert_eq!(interp.len(), 1);
        assert_eq!(interp.newest().map(|s| s.position.x), Some(1.0));
    }

    #[test]
    fn playback_trails_by_delay() {
        let mut c = observer();
        let mut interp = Interpolator::new(&InterpolationConfig {
            delay_secs: 0.1,
            buffer_len: 8,
        });
        interp.push(snap(1.0, 0.0));
        assert_eq!(interp.render_time(), Some(0.9));
        interp.push(snap(1.1, 1.0));
        interp.advance(&mut c, 0.15);
        let x = c.render_pose().position.x;
        assert!((x - 0.5).abs() < 1e-3, "x = {x}");
    }

    #[test]
    fn buffer_is_bounded() {
        let mut interp = Interpolator::<MoveState>::new(&InterpolationConfig {
            delay_secs: 0.0,
            buffer_len: 3,
        });
        for i in 0..10 {
            interp.push(snap(i as f64, 0.0));
        }
        assert_eq!(interp.len(), 3);
    }

    #[test]
    fn observer_body_is_untouched() {
        let mut c = observer();
        let mut interp = Interpolator::new(&no_delay());
        interp.push(snap(0.0, 0.0));
        interp.push(snap(1.0, 10.0));
        interp.advance(&mut c, 0.5);
        assert_eq!(c.body().position(), Vec3::ZERO);
    }
}
