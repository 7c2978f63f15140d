//! Client implementation.
//!
//! The client maintains:
//! - A reliable control stream (handshake, entity lifecycle, ownership)
//! - An unreliable datagram socket (inputs out, snapshots in)
//! - A prediction controller for the entity it owns
//! - An interpolator per observed entity
//!
//! Everything received is queued by background tasks and applied in
//! [`GameClient::tick`].

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use anyhow::Context;
use netstate_shared::{
    config::EngineConfig,
    inbox::{
        drain, inboxes, spawn_control_reader, spawn_udp_receiver, ControlDelivery, Inboxes,
        ReceiverTask, SnapshotDelivery, SnapshotUpdate,
    },
    input::InputDevice,
    move_state::{MoveDiff, MoveInput, MoveState},
    movement::{CharacterMovement, RenderPose},
    net::{
        send_hello, send_input, ClientId, EntityId, EntitySpawn, NetMsg, ReliableConn,
        ReliableWriter, PROTOCOL_VERSION,
    },
    physics::SimpleBody,
    state::StateDiff,
    system::{NetworkMode, NetworkedStateSystem},
    wire::WireError,
};
use tokio::{
    net::{TcpStream, UdpSocket},
    sync::mpsc::{self, UnboundedReceiver},
};
use tracing::{debug, info, warn};

use crate::{
    input::sample_intent,
    interp::Interpolator,
    predict::{PredictionController, PredictionStats, Reconciliation},
};

/// Entity kind this client simulates.
pub type Character = CharacterMovement<SimpleBody>;

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Handshake done; ticking.
    Connected,
    /// Connection failed or closed. Carries the reason.
    Disconnected(String),
}

/// How the local peer runs one replicated entity.
enum EntityView {
    Predicted(PredictionController<Character>),
    Observed {
        system: Character,
        interp: Interpolator<MoveState>,
    },
}

/// High-level game client.
pub struct GameClient {
    pub client_id: ClientId,
    pub state: ClientState,
    cfg: EngineConfig,

    reliable: ReliableWriter,
    control_rx: UnboundedReceiver<((), anyhow::Result<NetMsg>)>,
    _control_task: ReceiverTask,

    udp: Arc<UdpSocket>,
    server_udp: SocketAddr,
    inbox: Inboxes<MoveInput, MoveState, MoveDiff>,
    _udp_task: ReceiverTask,

    entities: BTreeMap<EntityId, EntityView>,
    /// Newest decoded snapshot per entity; base for incoming diffs.
    last_received: BTreeMap<EntityId, MoveState>,
    tick: u32,
}

impl GameClient {
    /// Connects to a server and performs handshake.
    pub async fn connect(cfg: &EngineConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;

        info!(server = %server_addr, name = %cfg.player_name, "Connecting to server");

        // Bind UDP first so we can tell the server where to send snapshots.
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let udp = Arc::new(UdpSocket::bind(bind).await.context("udp bind")?);
        let client_udp_port = udp.local_addr().context("udp local_addr")?.port();

        let stream = TcpStream::connect(server_addr)
            .await
            .context("tcp connect")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        let mut reliable = ReliableConn::new(stream);

        reliable
            .send(&NetMsg::Hello {
                protocol: PROTOCOL_VERSION,
            })
            .await?;
        reliable.send(&NetMsg::UdpHello { client_udp_port }).await?;

        let (client_id, tick_hz) = match reliable.recv().await? {
            NetMsg::Welcome { client_id, tick_hz } => (client_id, tick_hz),
            NetMsg::Disconnect { reason } => anyhow::bail!("server refused: {reason}"),
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };
        if tick_hz != cfg.tick_hz {
            warn!(server = tick_hz, local = cfg.tick_hz, "Tick rate mismatch; using server's");
        }
        let cfg = EngineConfig {
            tick_hz,
            ..cfg.clone()
        };

        info!(client_id = ?client_id, tick_hz, "Connected to server");

        let (reader, writer) = reliable.into_split();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let control_task = spawn_control_reader((), reader, control_tx);

        let (senders, inbox) = inboxes();
        let udp_task = spawn_udp_receiver(udp.clone(), senders);

        send_hello(&udp, server_addr, client_id).await?;

        Ok(Self {
            client_id,
            state: ClientState::Connected,
            cfg,
            reliable: writer,
            control_rx,
            _control_task: control_task,
            udp,
            server_udp: server_addr,
            inbox,
            _udp_task: udp_task,
            entities: BTreeMap::new(),
            last_received: BTreeMap::new(),
            tick: 0,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn local_udp_addr(&self) -> anyhow::Result<SocketAddr> {
        self.udp.local_addr().context("udp local_addr")
    }

    pub fn tick_count(&self) -> u32 {
        self.tick
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    /// The entity this client predicts, if any.
    pub fn owned_entity(&self) -> Option<EntityId> {
        self.entities
            .iter()
            .find(|(_, v)| matches!(v, EntityView::Predicted(_)))
            .map(|(id, _)| *id)
    }

    /// Live simulated state of an owned entity.
    pub fn predicted_state(&self, id: EntityId) -> Option<MoveState> {
        match self.entities.get(&id)? {
            EntityView::Predicted(ctl) => {
                Some(ctl.system().get_current_state(ctl.latest_command(), self.time()))
            }
            EntityView::Observed { .. } => None,
        }
    }

    pub fn prediction_stats(&self, id: EntityId) -> Option<PredictionStats> {
        match self.entities.get(&id)? {
            EntityView::Predicted(ctl) => Some(ctl.stats()),
            EntityView::Observed { .. } => None,
        }
    }

    /// Where `id` is drawn this frame.
    pub fn render_pose(&self, id: EntityId) -> Option<RenderPose> {
        match self.entities.get(&id)? {
            EntityView::Predicted(ctl) => Some(ctl.system().render_pose()),
            EntityView::Observed { system, .. } => Some(system.render_pose()),
        }
    }

    fn time(&self) -> f64 {
        self.tick as f64 * self.cfg.fixed_dt() as f64
    }

    /// Advances one client tick: apply everything received, predict the
    /// owned entity from `input`, send its inputs and advance observers.
    pub async fn tick(&mut self, input: &(dyn InputDevice + Sync)) -> anyhow::Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.tick += 1;
        let time = self.time();
        let dt = self.cfg.fixed_dt() as f64;

        self.process_control();
        self.process_datagrams().await;
        if !self.is_connected() {
            return Ok(());
        }

        // Polled once, and only when this peer owns something.
        let mut sampled = None;
        for (&id, view) in self.entities.iter_mut() {
            match view {
                EntityView::Predicted(ctl) => {
                    let intent = *sampled.get_or_insert_with(|| sample_intent(input));
                    ctl.system_mut().set_intent(intent);
                    ctl.predict_tick(self.tick, time);
                    let inputs = ctl.outgoing_inputs();
                    send_input(&self.udp, self.server_udp, self.client_id, id, &inputs)
                        .await
                        .context("send inputs")?;
                }
                EntityView::Observed { system, interp } => interp.advance(system, dt),
            }
        }
        Ok(())
    }

    fn process_control(&mut self) {
        for ((), event) in drain(&mut self.control_rx) {
            match event {
                Ok(NetMsg::EntitySpawn(spawn)) => self.on_spawn(spawn),
                Ok(NetMsg::OwnershipChanged { id, owner }) => self.on_ownership(id, owner),
                Ok(NetMsg::EntityDelete { id }) => {
                    debug!(entity = ?id, "Entity deleted");
                    self.entities.remove(&id);
                    self.last_received.remove(&id);
                }
                Ok(NetMsg::Disconnect { reason }) => {
                    info!(reason = %reason, "Disconnected from server");
                    self.state = ClientState::Disconnected(reason);
                }
                Ok(other) => debug!(?other, "Unhandled reliable message"),
                Err(e) => {
                    warn!(error = %e, "Reliable connection error");
                    self.state = ClientState::Disconnected(e.to_string());
                }
            }
        }
    }

    fn on_spawn(&mut self, spawn: EntitySpawn) {
        debug!(entity = ?spawn.id, owner = ?spawn.owner, "Entity spawn received");
        let system = CharacterMovement::spawn(&self.cfg, spawn.position);
        let view = if spawn.owner == Some(self.client_id) {
            EntityView::Predicted(PredictionController::new(system, &self.cfg.prediction))
        } else {
            self.observe(system)
        };
        self.entities.insert(spawn.id, view);
    }

    fn on_ownership(&mut self, id: EntityId, owner: Option<ClientId>) {
        let Some(view) = self.entities.remove(&id) else {
            return;
        };
        let ours = owner == Some(self.client_id);
        let view = match view {
            EntityView::Observed { mut system, .. } if ours => {
                // Start from the last known authoritative state.
                if let Some(s) = self.last_received.get(&id) {
                    system.snap_to(s);
                }
                let mut ctl = PredictionController::new(system, &self.cfg.prediction);
                ctl.reset();
                info!(entity = ?id, "Took ownership");
                EntityView::Predicted(ctl)
            }
            EntityView::Predicted(ctl) if !ours => {
                info!(entity = ?id, "Lost ownership");
                self.observe(ctl.into_system())
            }
            unchanged => unchanged,
        };
        self.entities.insert(id, view);
    }

    fn observe(&self, mut system: Character) -> EntityView {
        system.set_mode(NetworkMode::Observer);
        EntityView::Observed {
            system,
            interp: Interpolator::new(&self.cfg.interpolation),
        }
    }

    async fn process_datagrams(&mut self) {
        for event in drain(&mut self.inbox.control) {
            match event {
                ControlDelivery::Malformed { from, error } if from == self.server_udp => {
                    self.fail(format!("malformed datagram: {error}")).await;
                    return;
                }
                other => debug!(?other, "Ignoring gameplay control datagram"),
            }
        }

        let stray = drain(&mut self.inbox.inputs).len();
        if stray > 0 {
            debug!(count = stray, "Ignoring inputs sent to client");
        }

        for SnapshotDelivery {
            from,
            entity,
            update,
        } in drain(&mut self.inbox.snapshots)
        {
            if from != self.server_udp {
                debug!(%from, "Snapshot from unknown peer");
                continue;
            }
            let state = match self.resolve(entity, update) {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(error) => {
                    self.fail(format!("corrupt diff for {entity:?}: {error}")).await;
                    return;
                }
            };
            self.apply_snapshot(entity, state);
        }
    }

    /// Turns a snapshot update into a full state. Diffs whose base was never
    /// received are skipped; the next full snapshot resyncs.
    fn resolve(
        &mut self,
        entity: EntityId,
        update: SnapshotUpdate<MoveState, MoveDiff>,
    ) -> Result<Option<MoveState>, WireError> {
        let state = match update {
            SnapshotUpdate::Full(state) => state,
            SnapshotUpdate::Diff(diff) => {
                let Some(base) = self.last_received.get(&entity) else {
                    return Ok(None);
                };
                match diff.apply(base) {
                    Ok(state) => state,
                    Err(WireError::BaseMismatch { expected, actual }) => {
                        debug!(entity = ?entity, expected, actual, "Diff base not held");
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        if let Some(prev) = self.last_received.get(&entity) {
            if state.time < prev.time {
                return Ok(None);
            }
        }
        self.last_received.insert(entity, state.clone());
        Ok(Some(state))
    }

    fn apply_snapshot(&mut self, entity: EntityId, state: MoveState) {
        match self.entities.get_mut(&entity) {
            Some(EntityView::Predicted(ctl)) => match ctl.on_server_state(&state) {
                Reconciliation::Accepted | Reconciliation::Stale => {}
                outcome => debug!(entity = ?entity, ?outcome, "Reconciled"),
            },
            Some(EntityView::Observed { interp, .. }) => {
                interp.push(state);
            }
            None => debug!(entity = ?entity, "Snapshot for unknown entity"),
        }
    }

    /// Fails the connection: tells the server why and stops ticking.
    async fn fail(&mut self, reason: String) {
        warn!(reason = %reason, "Dropping connection");
        let _ = self
            .reliable
            .send(&NetMsg::Disconnect {
                reason: reason.clone(),
            })
            .await;
        self.state = ClientState::Disconnected(reason);
    }

    /// Leaves the server.
    pub async fn disconnect(&mut self, reason: &str) -> anyhow::Result<()> {
        if self.is_connected() {
            self.reliable
                .send(&NetMsg::Disconnect {
                    reason: reason.to_string(),
                })
                .await?;
            self.state = ClientState::Disconnected(reason.to_string());
        }
        Ok(())
    }

    /// Returns the server's gameplay address.
    pub fn server_peer(&self) -> SocketAddr {
        self.server_udp
    }
}
