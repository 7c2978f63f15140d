//! Prediction and reconciliation.
//!
//! The owning client simulates its entity ahead of the server. Every command
//! and the state it produced are kept in bounded rings. When an authoritative
//! snapshot arrives, the predicted state for the same command is compared
//! against it; on divergence the entity is rewound to the server state and the
//! unacknowledged commands are replayed on top.

use netstate_shared::{
    config::PredictionConfig,
    history::History,
    net::MAX_INPUT_BATCH,
    state::{InputRecord, StateRecord, Tolerance, NO_COMMAND},
    system::{NetworkMode, NetworkedStateSystem},
};
use tracing::{debug, warn};

/// Outcome of applying one authoritative snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Prediction matched within tolerance.
    Accepted,
    /// Rewound, replayed and blended in smoothly.
    Corrected { replayed: usize },
    /// Rewound, replayed and teleported.
    Snapped { replayed: usize },
    /// Older than an already applied snapshot; ignored.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictionStats {
    pub predicted: u64,
    pub accepted: u64,
    pub corrections: u64,
    pub snaps: u64,
    pub replayed: u64,
    pub stale: u64,
    /// Commands evicted from the ring before the server acknowledged them.
    pub dropped_unacked: u64,
}

#[derive(Debug, Clone)]
struct PredictedCommand<I> {
    input: I,
    time: f64,
}

pub struct PredictionController<S: NetworkedStateSystem> {
    system: S,
    tolerance: Tolerance,
    snap_distance: f32,
    input_redundancy: usize,
    commands: History<PredictedCommand<S::Input>>,
    states: History<S::State>,
    next_command: u32,
    last_ack: u32,
    force_snap: bool,
    stats: PredictionStats,
}

impl<S: NetworkedStateSystem> PredictionController<S> {
    /// Takes over `system` and puts it in [`NetworkMode::Input`].
    pub fn new(mut system: S, cfg: &PredictionConfig) -> Self {
        system.set_mode(NetworkMode::Input);
        Self {
            system,
            tolerance: cfg.tolerance(),
            snap_distance: cfg.snap_distance,
            input_redundancy: cfg.input_redundancy.clamp(1, MAX_INPUT_BATCH),
            commands: History::new(cfg.history_len),
            states: History::new(cfg.history_len),
            next_command: NO_COMMAND + 1,
            last_ack: NO_COMMAND,
            force_snap: false,
            stats: PredictionStats::default(),
        }
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }

    pub fn into_system(self) -> S {
        self.system
    }

    pub fn stats(&self) -> PredictionStats {
        self.stats
    }

    pub fn last_acknowledged(&self) -> u32 {
        self.last_ack
    }

    /// Newest command issued, or [`NO_COMMAND`].
    pub fn latest_command(&self) -> u32 {
        self.next_command - 1
    }

    /// Commands issued but not yet acknowledged and still retained.
    pub fn pending(&self) -> usize {
        self.commands.len()
    }

    pub fn predicted_states(&self) -> impl Iterator<Item = &S::State> {
        self.states.iter()
    }

    /// Runs one predicted tick: samples a command, simulates it and records
    /// both the command and the resulting state.
    pub fn predict_tick(&mut self, tick: u32, time: f64) -> S::Input {
        let number = self.next_command;
        self.next_command += 1;

        let input = self.system.get_command(number, tick);
        self.system.tick(Some(&input), time, false);

        let evicted = self.commands.push(PredictedCommand {
            input: input.clone(),
            time,
        });
        if let Some(old) = evicted {
            let n = old.input.command_number();
            if n > self.last_ack {
                self.stats.dropped_unacked += 1;
                warn!(
                    command = n,
                    last_ack = self.last_ack,
                    "Prediction history full; dropped unacknowledged command"
                );
            }
        }

        self.create_current_state(time);
        self.stats.predicted += 1;
        input
    }

    /// Captures the live state, tagged with the newest command, and appends
    /// it to the predicted-state ring.
    pub fn create_current_state(&mut self, time: f64) -> S::State {
        let state = self.system.get_current_state(self.latest_command(), time);
        self.states.push(state.clone());
        state
    }

    /// Newest unacknowledged commands, oldest first, to resend this tick.
    pub fn outgoing_inputs(&self) -> Vec<S::Input> {
        let unacked: Vec<&PredictedCommand<S::Input>> = self
            .commands
            .iter()
            .filter(|c| c.input.command_number() > self.last_ack)
            .collect();
        let skip = unacked.len().saturating_sub(self.input_redundancy);
        unacked
            .into_iter()
            .skip(skip)
            .map(|c| c.input.clone())
            .collect()
    }

    pub fn needs_correction(&self, server: &S::State, local: &S::State) -> bool {
        !server.within_tolerance(local, &self.tolerance)
    }

    /// Applies an authoritative snapshot of the owned entity.
    pub fn on_server_state(&mut self, server: &S::State) -> Reconciliation {
        let ack = server.last_processed_command();
        let stale = if self.force_snap {
            ack < self.last_ack
        } else {
            ack <= self.last_ack
        };
        if stale {
            self.stats.stale += 1;
            return Reconciliation::Stale;
        }

        let local = if ack > self.latest_command() {
            None
        } else {
            self.states
                .find_newest(|s| s.last_processed_command() <= ack)
                .cloned()
        };

        self.last_ack = ack;
        self.commands.retain(|c| c.input.command_number() > ack);
        self.states.retain(|s| s.last_processed_command() > ack);

        let forced = self.force_snap || local.is_none();
        if let Some(local) = &local {
            if !self.force_snap && !self.needs_correction(server, local) {
                self.stats.accepted += 1;
                return Reconciliation::Accepted;
            }
        }
        if local.is_none() && !self.force_snap {
            warn!(
                ack,
                latest = self.latest_command(),
                "Server state outside prediction history; forcing snap"
            );
        }

        let present = self.current_state(server.time());
        self.system.set_current_state(server);
        let replayed = self.replay_states(server, usize::MAX);
        let corrected = self.current_state(server.time());
        let error = present.position_error(&corrected);
        self.stats.replayed += replayed as u64;
        self.force_snap = false;

        if forced || error > self.snap_distance {
            self.snap_to(&corrected);
            self.stats.snaps += 1;
            debug!(ack, replayed, error, "Prediction snapped");
            Reconciliation::Snapped { replayed }
        } else {
            self.system.set_current_state(&present);
            self.move_to(&corrected);
            self.stats.corrections += 1;
            debug!(ack, replayed, error, "Prediction corrected");
            Reconciliation::Corrected { replayed }
        }
    }

    /// Instant teleport of the owned entity.
    pub fn snap_to(&mut self, state: &S::State) {
        self.system.snap_to(state);
    }

    /// Smoothed correction of the owned entity.
    pub fn move_to(&mut self, state: &S::State) {
        self.system.move_to(state);
    }

    /// Re-simulates up to `count` retained commands issued after `base` in
    /// their original order, with one-shot effects suppressed, and rewrites
    /// the predicted states they produced. The live state must already equal
    /// `base`. Returns how many commands were replayed.
    pub fn replay_states(&mut self, base: &S::State, count: usize) -> usize {
        let ack = base.last_processed_command();
        let replay: Vec<PredictedCommand<S::Input>> = self
            .commands
            .iter()
            .filter(|c| c.input.command_number() > ack)
            .take(count)
            .cloned()
            .collect();

        for cmd in &replay {
            let number = cmd.input.command_number();
            self.system.tick(Some(&cmd.input), cmd.time, true);
            let state = self.system.get_current_state(number, cmd.time);
            match self
                .states
                .position_newest(|s| s.last_processed_command() == number)
            {
                Some(i) => {
                    if let Some(slot) = self.states.get_mut(i) {
                        *slot = state;
                    }
                }
                None => {
                    self.states.push(state);
                }
            }
        }
        replay.len()
    }

    /// Discards all history and snaps on the next authoritative snapshot.
    /// Used on disconnect and ownership transfer.
    pub fn reset(&mut self) {
        self.commands.clear();
        self.states.clear();
        self.force_snap = true;
    }

    fn current_state(&self, fallback_time: f64) -> S::State {
        let time = self.states.newest().map_or(fallback_time, |s| s.time());
        self.system.get_current_state(self.latest_command(), time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netstate_shared::{
        config::EngineConfig,
        math::Vec3,
        move_state::{MoveInput, MoveState},
        movement::{CharacterMovement, MoveIntent, MovementEffect},
        physics::SimpleBody,
    };

    type Character = CharacterMovement<SimpleBody>;

    fn cfg() -> EngineConfig {
        EngineConfig::default()
    }

    fn character() -> Character {
        CharacterMovement::spawn(&cfg(), Vec3::ZERO)
    }

    fn time_of(tick: u32) -> f64 {
        tick as f64 * cfg().fixed_dt() as f64
    }

    fn forward() -> MoveIntent {
        MoveIntent {
            move_z: 1.0,
            ..MoveIntent::default()
        }
    }

    /// Server-side run of `commands`, replacing any listed as lost with an
    /// empty command. Returns the state after each command.
    fn authority_run(commands: &[MoveInput], lost: &[u32]) -> Vec<MoveState> {
        let mut server = character();
        server.set_mode(NetworkMode::Authority);
        commands
            .iter()
            .map(|c| {
                let applied = if lost.contains(&c.command_number) {
                    MoveInput::empty(c.command_number, c.tick)
                } else {
                    c.clone()
                };
                let time = time_of(c.tick);
                server.tick(Some(&applied), time, false);
                server.get_current_state(c.command_number, time)
            })
            .collect()
    }

    #[test]
    fn matching_server_states_need_no_correction() {
        let mut ctl = PredictionController::new(character(), &cfg().prediction);
        ctl.system_mut().set_intent(forward());

        let mut sent = Vec::new();
        for tick in 1..=10 {
            sent.push(ctl.predict_tick(tick, time_of(tick)));
        }

        let server = authority_run(&sent, &[]);
        let speed = server[9].velocity.len();
        assert!((speed - 5.0).abs() < 1e-3, "speed {speed}");

        for s in &server {
            assert_eq!(ctl.on_server_state(s), Reconciliation::Accepted);
        }
        assert_eq!(ctl.stats().corrections + ctl.stats().snaps, 0);
        assert_eq!(ctl.pending(), 0);
    }

    #[test]
    fn lost_jump_is_corrected_by_replay() {
        let mut ctl = PredictionController::new(character(), &cfg().prediction);

        let mut sent = Vec::new();
        for tick in 1..=12 {
            ctl.system_mut().set_intent(MoveIntent {
                jump: tick == 5,
                ..forward()
            });
            sent.push(ctl.predict_tick(tick, time_of(tick)));
        }
        assert!(sent[4].jump());
        let jumps = ctl.system_mut().drain_effects();
        assert_eq!(jumps, vec![MovementEffect::Jumped { command_number: 5 }]);

        let server = authority_run(&sent, &[5]);
        for s in &server[..4] {
            assert_eq!(ctl.on_server_state(s), Reconciliation::Accepted);
        }

        let local = ctl
            .predicted_states()
            .find(|s| s.last_processed_command == 5)
            .cloned()
            .unwrap();
        assert!(ctl.needs_correction(&server[4], &local));

        let outcome = ctl.on_server_state(&server[4]);
        assert!(
            matches!(
                outcome,
                Reconciliation::Corrected { replayed: 7 } | Reconciliation::Snapped { replayed: 7 }
            ),
            "{outcome:?}"
        );

        let now = ctl.system().get_current_state(12, time_of(12));
        assert_eq!(now, server[11]);
        // Replay must not repeat the jump effect.
        assert!(ctl.system_mut().drain_effects().is_empty());

        for s in &server[5..] {
            assert_eq!(ctl.on_server_state(s), Reconciliation::Accepted);
        }
    }

    #[test]
    fn ack_outside_history_forces_snap() {
        let mut prediction = cfg().prediction;
        prediction.history_len = 4;
        let mut ctl = PredictionController::new(character(), &prediction);
        ctl.system_mut().set_intent(forward());

        let mut sent = Vec::new();
        for tick in 1..=10 {
            sent.push(ctl.predict_tick(tick, time_of(tick)));
        }
        assert_eq!(ctl.stats().dropped_unacked, 6);

        let server = authority_run(&sent, &[]);
        assert_eq!(
            ctl.on_server_state(&server[1]),
            Reconciliation::Snapped { replayed: 4 }
        );
        assert_eq!(ctl.last_acknowledged(), 2);
    }

    #[test]
    fn stale_snapshots_are_ignored() {
        let mut ctl = PredictionController::new(character(), &cfg().prediction);
        ctl.system_mut().set_intent(forward());
        let mut sent = Vec::new();
        for tick in 1..=3 {
            sent.push(ctl.predict_tick(tick, time_of(tick)));
        }
        let server = authority_run(&sent, &[]);

        assert_eq!(ctl.on_server_state(&server[2]), Reconciliation::Accepted);
        assert_eq!(ctl.on_server_state(&server[1]), Reconciliation::Stale);
        assert_eq!(ctl.on_server_state(&server[2]), Reconciliation::Stale);
        assert_eq!(ctl.stats().stale, 2);
    }

    #[test]
    fn large_divergence_snaps_small_divergence_moves() {
        let mut ctl = PredictionController::new(character(), &cfg().prediction);
        ctl.system_mut().set_intent(forward());
        let mut sent = Vec::new();
        for tick in 1..=3 {
            sent.push(ctl.predict_tick(tick, time_of(tick)));
        }
        let server = authority_run(&sent, &[]);

        let mut nudged = server[0].clone();
        nudged.position.x += 0.5;
        assert_eq!(
            ctl.on_server_state(&nudged),
            Reconciliation::Corrected { replayed: 2 }
        );
        assert!(ctl.system().visual_offset().len() > 0.4);

        let mut far = server[1].clone();
        far.position.x += 10.0;
        assert_eq!(
            ctl.on_server_state(&far),
            Reconciliation::Snapped { replayed: 1 }
        );
        assert_eq!(ctl.system().visual_offset(), Vec3::ZERO);
    }

    #[test]
    fn outgoing_inputs_are_redundant_and_bounded() {
        let mut ctl = PredictionController::new(character(), &cfg().prediction);
        for tick in 1..=6 {
            ctl.predict_tick(tick, time_of(tick));
        }
        let numbers: Vec<u32> = ctl
            .outgoing_inputs()
            .iter()
            .map(|c| c.command_number)
            .collect();
        assert_eq!(numbers, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn oversized_redundancy_fits_one_datagram() {
        use netstate_shared::net::{send_input, ClientId, EntityId, LoopbackNetwork};

        let mut pc = cfg().prediction;
        pc.input_redundancy = 40;
        let mut ctl = PredictionController::new(character(), &pc);
        for tick in 1..=40 {
            ctl.predict_tick(tick, time_of(tick));
        }
        let inputs = ctl.outgoing_inputs();
        assert_eq!(inputs.len(), MAX_INPUT_BATCH);
        assert_eq!(inputs[0].command_number, 40 - MAX_INPUT_BATCH as u32 + 1);

        let net = LoopbackNetwork::new();
        let (tx, _) = net.endpoint(([127, 0, 0, 1], 1).into());
        let (_, mut rx) = net.endpoint(([127, 0, 0, 1], 2).into());
        send_input(&tx, ([127, 0, 0, 1], 2).into(), ClientId(1), EntityId(1), &inputs)
            .await
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn reset_forces_snap_on_next_snapshot() {
        let mut ctl = PredictionController::new(character(), &cfg().prediction);
        let mut sent = Vec::new();
        for tick in 1..=3 {
            sent.push(ctl.predict_tick(tick, time_of(tick)));
        }
        let server = authority_run(&sent, &[]);
        assert_eq!(ctl.on_server_state(&server[1]), Reconciliation::Accepted);

        ctl.reset();
        assert_eq!(ctl.pending(), 0);
        assert_eq!(
            ctl.on_server_state(&server[1]),
            Reconciliation::Snapped { replayed: 0 }
        );
        assert_eq!(
            ctl.on_server_state(&server[2]),
            Reconciliation::Snapped { replayed: 0 }
        );
    }
}
