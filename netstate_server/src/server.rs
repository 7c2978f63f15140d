//! Server implementation.
//!
//! Authoritative fixed-timestep loop. Each step:
//! - drains control-plane events and the UDP inboxes,
//! - queues received inputs on the entity their sender owns,
//! - steps every entity once,
//! - sends every client a snapshot (or diff) of every entity.
//!
//! Determinism notes:
//! - Keep simulation in a fixed timestep.
//! - Avoid wall-clock-dependent branching in gameplay code.
//! - Use stable ordering when iterating collections.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use netstate_shared::{
    config::EngineConfig,
    inbox::{
        drain, inboxes, spawn_control_reader, spawn_udp_receiver, ControlDelivery, InputDelivery,
        Inboxes, ReceiverTask,
    },
    math::Vec3,
    move_state::{MoveDiff, MoveInput, MoveState},
    movement::CharacterMovement,
    net::{
        send_diff, send_snapshot, ClientId, EntityId, EntitySpawn, NetMsg, ReliableConn,
        ReliableListener, ReliableWriter, PROTOCOL_VERSION,
    },
    physics::{RigidBody, SimpleBody},
    state::StateDiff,
};
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::authority::AuthorityEntity;

/// Entity kind simulated by this server.
pub type Character = CharacterMovement<SimpleBody>;

type ControlEvent = (ClientId, anyhow::Result<NetMsg>);

/// How long a new connection may take to send `Hello` and `UdpHello`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection that completed the client half of the handshake.
struct Handshake {
    conn: ReliableConn,
    peer: SocketAddr,
    client_udp_port: u16,
}

/// Distance between consecutive spawn points along X.
const SPAWN_SPACING: f32 = 2.0;

/// Connected client state.
struct ConnectedClient {
    reliable: ReliableWriter,
    _reader: ReceiverTask,
    udp_peer: SocketAddr,
}

/// Game server.
pub struct GameServer {
    pub cfg: EngineConfig,
    tcp: ReliableListener,
    udp: Arc<UdpSocket>,
    inbox: Inboxes<MoveInput, MoveState, MoveDiff>,
    _udp_task: ReceiverTask,
    control_tx: UnboundedSender<ControlEvent>,
    control_rx: UnboundedReceiver<ControlEvent>,
    handshake_tx: UnboundedSender<anyhow::Result<Handshake>>,
    handshake_rx: UnboundedReceiver<anyhow::Result<Handshake>>,
    clients: BTreeMap<ClientId, ConnectedClient>,
    entities: BTreeMap<EntityId, AuthorityEntity<Character>>,
    next_entity: u32,
    tick: u32,
}

impl GameServer {
    /// Binds the TCP listener and a UDP socket on the same address. With port
    /// 0 the UDP socket takes the port the listener got.
    pub async fn new(mut cfg: EngineConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let local = tcp.local_addr()?;
        let udp = Arc::new(UdpSocket::bind(local).await.context("udp bind")?);
        cfg.server_addr = local.to_string();

        let (senders, inbox) = inboxes();
        let udp_task = spawn_udp_receiver(udp.clone(), senders);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();

        Ok(Self {
            cfg,
            tcp,
            udp,
            inbox,
            _udp_task: udp_task,
            control_tx,
            control_rx,
            handshake_tx,
            handshake_rx,
            clients: BTreeMap::new(),
            entities: BTreeMap::new(),
            next_entity: 1,
            tick: 0,
        })
    }

    /// Returns the local address (TCP and UDP share it).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    /// Lowest-numbered entity controlled by `client`, if any.
    pub fn entity_of(&self, client: ClientId) -> Option<EntityId> {
        self.owned_by(client).next()
    }

    fn owned_by(&self, client: ClientId) -> impl Iterator<Item = EntityId> + '_ {
        self.entities
            .values()
            .filter(move |e| e.owner() == Some(client))
            .map(|e| e.id())
    }

    pub fn entity(&self, id: EntityId) -> Option<&AuthorityEntity<Character>> {
        self.entities.get(&id)
    }

    /// Latest authoritative state of `id`.
    pub fn entity_state(&self, id: EntityId) -> Option<&MoveState> {
        self.entities.get(&id).and_then(|e| e.snapshot())
    }

    /// Accepts exactly one client (handshake + entity spawn).
    pub async fn accept_one(&mut self) -> anyhow::Result<ClientId> {
        let (conn, peer) = self.tcp.accept().await?;
        self.start_handshake(conn, peer);
        let handshake = self
            .handshake_rx
            .recv()
            .await
            .context("handshake channel closed")??;
        self.register(handshake).await
    }

    /// Accepts a client with timeout (non-blocking). The handshake itself
    /// runs in the background; a client whose handshake finished is
    /// registered on a later call.
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<ClientId>> {
        match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(Ok((conn, peer))) => self.start_handshake(conn, peer),
            Ok(Err(e)) => return Err(e),
            Err(_) => {} // Timeout
        }
        match self.handshake_rx.try_recv() {
            Ok(handshake) => self.register(handshake?).await.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn start_handshake(&self, conn: ReliableConn, peer: SocketAddr) {
        let tx = self.handshake_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(conn, peer))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("handshake from {peer} timed out")),
            };
            let _ = tx.send(result);
        });
    }

    async fn register(&mut self, handshake: Handshake) -> anyhow::Result<ClientId> {
        let Handshake {
            mut conn,
            peer,
            client_udp_port,
        } = handshake;

        let id = ClientId::new_unique();
        conn.send(&NetMsg::Welcome {
            client_id: id,
            tick_hz: self.cfg.tick_hz,
        })
        .await?;

        let (reader, mut writer) = conn.into_split();

        // Existing entities first, then the client's own.
        for e in self.entities.values() {
            writer
                .send(&NetMsg::EntitySpawn(spawn_msg(e)))
                .await
                .context("send existing entity")?;
        }
        let entity = self.spawn_entity(Some(id));
        let spawn = self
            .entities
            .get(&entity)
            .map(spawn_msg)
            .context("spawned entity missing")?;
        writer.send(&NetMsg::EntitySpawn(spawn.clone())).await?;
        self.broadcast(&NetMsg::EntitySpawn(spawn)).await;

        let udp_peer = SocketAddr::new(peer.ip(), client_udp_port);
        self.clients.insert(
            id,
            ConnectedClient {
                reliable: writer,
                _reader: spawn_control_reader(id, reader, self.control_tx.clone()),
                udp_peer,
            },
        );

        info!(client_id = ?id, %udp_peer, entity = ?entity, "Client connected");
        Ok(id)
    }

    /// Creates a server-side character at the next spawn point.
    pub fn spawn_entity(&mut self, owner: Option<ClientId>) -> EntityId {
        let id = EntityId(self.next_entity);
        self.next_entity += 1;
        let position = Vec3::new(SPAWN_SPACING * (id.0 - 1) as f32, 0.0, 0.0);
        let system = CharacterMovement::spawn(&self.cfg, position);
        self.entities.insert(
            id,
            AuthorityEntity::new(id, system, owner, &self.cfg.authority),
        );
        debug!(entity = ?id, owner = ?owner, "Spawned entity");
        id
    }

    /// Hands input ownership of `entity` to `owner` and tells every client.
    pub async fn transfer_ownership(
        &mut self,
        entity: EntityId,
        owner: Option<ClientId>,
    ) -> anyhow::Result<()> {
        let e = self
            .entities
            .get_mut(&entity)
            .context("entity not found")?;
        if let Some(owner) = owner {
            anyhow::ensure!(self.clients.contains_key(&owner), "client {owner:?} not found");
        }
        let previous = e.owner();
        e.set_owner(owner);

        info!(entity = ?entity, from = ?previous, to = ?owner, "Ownership transferred");
        self.broadcast(&NetMsg::OwnershipChanged { id: entity, owner })
            .await;
        Ok(())
    }

    /// Runs the server for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(self.cfg.fixed_dt());
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step(dt.as_secs_f32()).await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one fixed simulation step.
    pub async fn step(&mut self, dt_sec: f32) -> anyhow::Result<()> {
        self.tick += 1;
        let time = self.tick as f64 * dt_sec as f64;

        self.process_control().await;
        self.process_datagrams().await;

        for e in self.entities.values_mut() {
            e.step(self.tick, time);
        }

        self.send_snapshots().await;
        Ok(())
    }

    async fn process_control(&mut self) {
        for (id, event) in drain(&mut self.control_rx) {
            match event {
                Ok(NetMsg::Disconnect { reason }) => {
                    info!(client_id = ?id, reason = %reason, "Client disconnected");
                    self.remove_client(id, None).await;
                }
                Ok(other) => debug!(client_id = ?id, ?other, "Unexpected control message"),
                Err(e) => {
                    info!(client_id = ?id, error = %e, "Control connection closed");
                    self.remove_client(id, None).await;
                }
            }
        }
    }

    async fn process_datagrams(&mut self) {
        for event in drain(&mut self.inbox.control) {
            match event {
                ControlDelivery::Hello { from, client_id } => {
                    if let Some(c) = self.clients.get_mut(&client_id) {
                        if c.udp_peer != from {
                            debug!(client_id = ?client_id, %from, "Client UDP address updated");
                            c.udp_peer = from;
                        }
                    }
                }
                ControlDelivery::Malformed { from, error } => {
                    let culprit = self
                        .clients
                        .iter()
                        .find(|(_, c)| c.udp_peer == from)
                        .map(|(id, _)| *id);
                    match culprit {
                        Some(id) => {
                            warn!(client_id = ?id, %from, %error, "Malformed datagram; dropping client");
                            self.remove_client(id, Some(format!("malformed datagram: {error}")))
                                .await;
                        }
                        None => debug!(%from, %error, "Malformed datagram from unknown peer"),
                    }
                }
            }
        }

        for InputDelivery {
            from,
            client_id,
            entity,
            inputs,
        } in drain(&mut self.inbox.inputs)
        {
            let Some(e) = self.entities.get_mut(&entity) else {
                debug!(entity = ?entity, "Input for unknown entity");
                continue;
            };
            if e.owner() != Some(client_id) || !self.clients.contains_key(&client_id) {
                debug!(client_id = ?client_id, entity = ?entity, %from, "Input from non-owner");
                continue;
            }
            e.push_inputs(inputs);
        }

        let stray = drain(&mut self.inbox.snapshots).len();
        if stray > 0 {
            debug!(count = stray, "Ignoring snapshots sent to server");
        }
    }

    async fn send_snapshots(&self) {
        let interval = self.cfg.authority.full_snapshot_interval.max(1);
        let full = self.tick % interval == 0;

        for (&id, e) in &self.entities {
            let Some(state) = e.snapshot() else {
                continue;
            };
            let diff = if full {
                None
            } else {
                e.previous_snapshot(1).map(|base| MoveDiff::between(base, state))
            };

            for (client_id, c) in &self.clients {
                let sent = match &diff {
                    Some(d) => send_diff(&self.udp, c.udp_peer, id, d).await,
                    None => send_snapshot(&self.udp, c.udp_peer, id, state).await,
                };
                if let Err(e) = sent {
                    warn!(client_id = ?client_id, error = %e, "Snapshot send failed");
                }
            }
        }
    }

    /// Drops a client and every entity it owns. Sends `Disconnect` first when
    /// `reason` is given.
    pub async fn remove_client(&mut self, id: ClientId, reason: Option<String>) {
        let Some(mut client) = self.clients.remove(&id) else {
            return;
        };
        if let Some(reason) = reason {
            let _ = client.reliable.send(&NetMsg::Disconnect { reason }).await;
        }
        let owned: Vec<EntityId> = self.owned_by(id).collect();
        for entity in owned {
            self.entities.remove(&entity);
            self.broadcast(&NetMsg::EntityDelete { id: entity }).await;
        }
        info!(client_id = ?id, "Client removed");
    }

    async fn broadcast(&mut self, msg: &NetMsg) {
        for (id, c) in self.clients.iter_mut() {
            if let Err(e) = c.reliable.send(msg).await {
                warn!(client_id = ?id, error = %e, "Control send failed");
            }
        }
    }
}

async fn read_handshake(mut conn: ReliableConn, peer: SocketAddr) -> anyhow::Result<Handshake> {
    match conn.recv().await? {
        NetMsg::Hello { protocol } if protocol == PROTOCOL_VERSION => {}
        NetMsg::Hello { protocol } => {
            let reason = format!("protocol {protocol} unsupported, expected {PROTOCOL_VERSION}");
            let _ = conn.send(&NetMsg::Disconnect { reason: reason.clone() }).await;
            anyhow::bail!(reason);
        }
        other => anyhow::bail!("unexpected handshake msg: {other:?}"),
    }

    // Expect the client to announce its UDP port next.
    let client_udp_port = match conn.recv().await? {
        NetMsg::UdpHello { client_udp_port } => client_udp_port,
        other => anyhow::bail!("expected UdpHello, got {other:?}"),
    };
    Ok(Handshake {
        conn,
        peer,
        client_udp_port,
    })
}

fn spawn_msg(e: &AuthorityEntity<Character>) -> EntitySpawn {
    EntitySpawn {
        id: e.id(),
        owner: e.owner(),
        position: e.system().body().position(),
    }
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, EngineConfig)> {
    let cfg = EngineConfig {
        server_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        tick_hz,
        ..Default::default()
    };
    let server = GameServer::new(cfg).await?;
    let cfg = server.cfg.clone();
    Ok((server, cfg))
}
