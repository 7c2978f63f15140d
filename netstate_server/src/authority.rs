//! Authoritative command processing.
//!
//! Inputs arrive unreliably, duplicated (clients resend their newest
//! unacknowledged commands every tick) and out of order. [`CommandQueue`]
//! turns that stream back into a strictly increasing sequence; a command that
//! never shows up is given up on after a few ticks and applied as empty so
//! one lost datagram cannot stall the entity.

use std::collections::BTreeMap;

use netstate_shared::{
    config::AuthorityConfig,
    history::History,
    net::{ClientId, EntityId},
    state::{InputRecord, NO_COMMAND},
    system::{NetworkMode, NetworkedStateSystem},
};
use tracing::{debug, trace};

/// What the queue releases next.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot<I> {
    Command(I),
    /// The command never arrived within the gap timeout.
    Skipped(u32),
    /// Next command not here yet, later ones are.
    Waiting,
    /// Nothing buffered.
    Idle,
}

/// Per-owner reorder buffer.
#[derive(Debug, Clone)]
pub struct CommandQueue<I> {
    pending: BTreeMap<u32, I>,
    /// `None` until the first command of a stream is seen.
    last_released: Option<u32>,
    max_pending: usize,
    gap_wait_ticks: u32,
    gap_age: u32,
}

impl<I: InputRecord> CommandQueue<I> {
    pub fn new(cfg: &AuthorityConfig) -> Self {
        Self {
            pending: BTreeMap::new(),
            last_released: None,
            max_pending: cfg.max_pending_commands.max(1),
            gap_wait_ticks: cfg.gap_wait_ticks,
            gap_age: 0,
        }
    }

    /// Buffers a command. Returns `false` for duplicates, commands at or
    /// before the last released one and overflow.
    ///
    /// The first command ever pushed starts the stream; callers push each
    /// batch oldest first.
    pub fn push(&mut self, cmd: I) -> bool {
        let n = cmd.command_number();
        if n == NO_COMMAND {
            return false;
        }
        let last = *self.last_released.get_or_insert(n - 1);
        if n <= last || self.pending.contains_key(&n) {
            return false;
        }
        if self.pending.len() >= self.max_pending {
            debug!(command = n, "Command queue full; dropping");
            return false;
        }
        self.pending.insert(n, cmd);
        true
    }

    /// Advances the gap timer. Call once per server tick.
    pub fn tick(&mut self) {
        if self.head_missing() {
            self.gap_age += 1;
        } else {
            self.gap_age = 0;
        }
    }

    /// Releases the next command in order, if any.
    pub fn pop_ready(&mut self) -> Slot<I> {
        let Some(last) = self.last_released else {
            return Slot::Idle;
        };
        let next = last + 1;
        if let Some(cmd) = self.pending.remove(&next) {
            self.last_released = Some(next);
            return Slot::Command(cmd);
        }
        if self.pending.is_empty() {
            return Slot::Idle;
        }
        if self.gap_age >= self.gap_wait_ticks {
            self.last_released = Some(next);
            return Slot::Skipped(next);
        }
        Slot::Waiting
    }

    pub fn last_released(&self) -> Option<u32> {
        self.last_released
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forgets the current stream, e.g. when the owner changes.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_released = None;
        self.gap_age = 0;
    }

    fn head_missing(&self) -> bool {
        match (self.last_released, self.pending.keys().next()) {
            (Some(last), Some(&first)) => first > last + 1,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthorityStats {
    pub applied: u64,
    pub skipped: u64,
    pub settled: u64,
    pub rejected: u64,
}

/// Server-side driver of one networked entity.
pub struct AuthorityEntity<S: NetworkedStateSystem> {
    id: EntityId,
    owner: Option<ClientId>,
    system: S,
    queue: CommandQueue<S::Input>,
    max_catchup: usize,
    idle_ticks_before_settle: u32,
    idle_ticks: u32,
    last_processed: u32,
    snapshots: History<S::State>,
    stats: AuthorityStats,
}

impl<S: NetworkedStateSystem> AuthorityEntity<S> {
    pub fn new(
        id: EntityId,
        mut system: S,
        owner: Option<ClientId>,
        cfg: &AuthorityConfig,
    ) -> Self {
        system.set_mode(NetworkMode::Authority);
        Self {
            id,
            owner,
            system,
            queue: CommandQueue::new(cfg),
            max_catchup: cfg.max_catchup.max(1),
            idle_ticks_before_settle: cfg.idle_ticks_before_settle,
            idle_ticks: 0,
            last_processed: NO_COMMAND,
            snapshots: History::new(cfg.snapshot_history_len),
            stats: AuthorityStats::default(),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn owner(&self) -> Option<ClientId> {
        self.owner
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }

    pub fn stats(&self) -> AuthorityStats {
        self.stats
    }

    pub fn last_processed(&self) -> u32 {
        self.last_processed
    }

    /// Hands input ownership to `owner`. The new owner's command stream
    /// starts from scratch.
    pub fn set_owner(&mut self, owner: Option<ClientId>) {
        if self.owner == owner {
            return;
        }
        self.owner = owner;
        self.queue.reset();
        self.last_processed = NO_COMMAND;
        self.idle_ticks = 0;
    }

    /// Queues received commands. Returns how many were new.
    pub fn push_inputs(&mut self, inputs: impl IntoIterator<Item = S::Input>) -> usize {
        let mut accepted = 0;
        for cmd in inputs {
            if self.queue.push(cmd) {
                accepted += 1;
            } else {
                self.stats.rejected += 1;
            }
        }
        accepted
    }

    /// Runs one server tick and returns the resulting snapshot.
    pub fn step(&mut self, server_tick: u32, time: f64) -> S::State {
        self.queue.tick();

        let mut applied = 0;
        while applied < self.max_catchup {
            match self.queue.pop_ready() {
                Slot::Command(cmd) => {
                    trace!(entity = ?self.id, command = cmd.command_number(), "Applying command");
                    self.system.tick(Some(&cmd), time, false);
                    self.last_processed = cmd.command_number();
                    self.stats.applied += 1;
                }
                Slot::Skipped(n) => {
                    debug!(entity = ?self.id, command = n, "Command lost; applying empty");
                    let empty = S::Input::empty(n, server_tick);
                    self.system.tick(Some(&empty), time, false);
                    self.last_processed = n;
                    self.stats.skipped += 1;
                }
                Slot::Waiting | Slot::Idle => break,
            }
            applied += 1;
        }

        if applied == 0 {
            self.idle_ticks = self.idle_ticks.saturating_add(1);
            if self.idle_ticks >= self.idle_ticks_before_settle {
                self.system.tick(None, time, false);
                self.stats.settled += 1;
            }
        } else {
            self.idle_ticks = 0;
        }

        let state = self.system.get_current_state(self.last_processed, time);
        self.snapshots.push(state.clone());
        state
    }

    /// Newest snapshot produced by [`step`](Self::step).
    pub fn snapshot(&self) -> Option<&S::State> {
        self.snapshots.newest()
    }

    /// Snapshot produced `ticks_ago` steps before the newest one.
    pub fn previous_snapshot(&self, ticks_ago: usize) -> Option<&S::State> {
        let len = self.snapshots.len();
        len.checked_sub(1 + ticks_ago)
            .and_then(|i| self.snapshots.get(i))
    }
}
