//! Shared harness for the integration tests.
//!
//! [`LoopbackSession`] wires one predicting client to one authoritative
//! entity over an in-memory network, with the real inbox plumbing on both
//! ends. Each side's sender can be wrapped to lose datagrams.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use netstate_client::predict::{PredictionController, Reconciliation};
use netstate_server::{authority::AuthorityEntity, server::Character};
use netstate_shared::{
    config::EngineConfig,
    inbox::{drain, inboxes, spawn_channel_receiver, Inboxes, ReceiverTask, SnapshotUpdate},
    math::Vec3,
    move_state::{MoveDiff, MoveInput, MoveState},
    movement::{CharacterMovement, MoveIntent},
    net::{send_input, send_snapshot, ClientId, EntityId, LoopbackNetwork, LoopbackTransport, Transport},
    system::NetworkedStateSystem,
};

pub const CLIENT_ID: ClientId = ClientId(1);
pub const ENTITY: EntityId = EntityId(1);

pub fn client_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 2], 5000))
}

pub fn server_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], 4000))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Lets the spawned receive tasks move queued datagrams into the inboxes.
pub async fn pump() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Forwards datagrams only while open.
pub struct GatedTransport<T> {
    inner: T,
    open: AtomicBool,
}

impl<T> GatedTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            open: AtomicBool::new(true),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Relaxed);
    }
}

#[async_trait]
impl<T: Transport> Transport for GatedTransport<T> {
    async fn send_to(&self, peer: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
        if !self.open.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.inner.send_to(peer, payload).await
    }
}

type Inbox = Inboxes<MoveInput, MoveState, MoveDiff>;

/// One client-owned character, predicted on one end and simulated
/// authoritatively on the other.
pub struct LoopbackSession<C, A> {
    pub client: PredictionController<Character>,
    pub authority: AuthorityEntity<Character>,
    pub client_tx: C,
    pub server_tx: A,
    /// Every reconciliation outcome, in arrival order.
    pub outcomes: Vec<Reconciliation>,
    client_inbox: Inbox,
    server_inbox: Inbox,
    client_ticks: u32,
    server_ticks: u32,
    dt: f64,
    _receivers: [ReceiverTask; 2],
}

impl<C: Transport, A: Transport> LoopbackSession<C, A> {
    /// Must be called from inside a tokio runtime.
    pub fn new(
        cfg: &EngineConfig,
        wrap_client: impl FnOnce(LoopbackTransport) -> C,
        wrap_server: impl FnOnce(LoopbackTransport) -> A,
    ) -> Self {
        let net = LoopbackNetwork::new();
        let (client_end, client_rx) = net.endpoint(client_addr());
        let (server_end, server_rx) = net.endpoint(server_addr());
        let (client_senders, client_inbox) = inboxes::<MoveInput, MoveState, MoveDiff>();
        let (server_senders, server_inbox) = inboxes::<MoveInput, MoveState, MoveDiff>();
        let receivers = [
            spawn_channel_receiver(client_rx, client_senders),
            spawn_channel_receiver(server_rx, server_senders),
        ];

        Self {
            client: PredictionController::new(
                CharacterMovement::spawn(cfg, Vec3::ZERO),
                &cfg.prediction,
            ),
            authority: AuthorityEntity::new(
                ENTITY,
                CharacterMovement::spawn(cfg, Vec3::ZERO),
                Some(CLIENT_ID),
                &cfg.authority,
            ),
            client_tx: wrap_client(client_end),
            server_tx: wrap_server(server_end),
            outcomes: Vec::new(),
            client_inbox,
            server_inbox,
            client_ticks: 0,
            server_ticks: 0,
            dt: cfg.fixed_dt() as f64,
            _receivers: receivers,
        }
    }

    pub fn set_intent(&mut self, intent: MoveIntent) {
        self.client.system_mut().set_intent(intent);
    }

    /// Predicts one command and sends the redundant input window.
    pub async fn client_tick(&mut self) -> anyhow::Result<()> {
        self.client_ticks += 1;
        let time = self.client_ticks as f64 * self.dt;
        self.client.predict_tick(self.client_ticks, time);
        self.send_inputs().await
    }

    async fn send_inputs(&mut self) -> anyhow::Result<()> {
        let inputs = self.client.outgoing_inputs();
        if inputs.is_empty() {
            return Ok(());
        }
        send_input(&self.client_tx, server_addr(), CLIENT_ID, ENTITY, &inputs).await
    }

    /// Applies received inputs, steps the entity and sends its snapshot.
    pub async fn server_tick(&mut self) -> anyhow::Result<MoveState> {
        pump().await;
        for delivery in drain(&mut self.server_inbox.inputs) {
            if delivery.entity == ENTITY && delivery.client_id == CLIENT_ID {
                self.authority.push_inputs(delivery.inputs);
            }
        }
        self.server_ticks += 1;
        let time = self.server_ticks as f64 * self.dt;
        let state = self.authority.step(self.server_ticks, time);
        send_snapshot(&self.server_tx, client_addr(), ENTITY, &state).await?;
        Ok(state)
    }

    /// Reconciles every snapshot that made it to the client.
    pub async fn client_receive(&mut self) {
        pump().await;
        for delivery in drain(&mut self.client_inbox.snapshots) {
            if let SnapshotUpdate::Full(state) = delivery.update {
                let outcome = self.client.on_server_state(&state);
                self.outcomes.push(outcome);
            }
        }
    }

    /// One lock-step frame: predict, simulate, reconcile.
    pub async fn round(&mut self) -> anyhow::Result<()> {
        self.client_tick().await?;
        self.server_tick().await?;
        self.client_receive().await;
        Ok(())
    }

    /// Stops predicting and keeps resending until the client holds an
    /// acknowledgement of its newest command. Returns `false` if that did
    /// not happen within `max_rounds`.
    pub async fn flush(&mut self, max_rounds: usize) -> anyhow::Result<bool> {
        for _ in 0..max_rounds {
            if self.client.last_acknowledged() == self.client.latest_command() {
                return Ok(true);
            }
            self.send_inputs().await?;
            self.server_tick().await?;
            self.client_receive().await;
        }
        Ok(self.client.last_acknowledged() == self.client.latest_command())
    }

    /// Distance between the client's simulated body and the authority's.
    pub fn position_error(&self) -> f32 {
        let latest = self.client.latest_command();
        let local = self.client.system().get_current_state(latest, 0.0);
        let server = self.authority.system().get_current_state(latest, 0.0);
        (local.position - server.position).len()
    }

    pub fn count(&self, pred: impl Fn(&Reconciliation) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}
