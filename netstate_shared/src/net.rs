//! Networking primitives.
//!
//! Two planes:
//! - Control (TCP): length-prefixed JSON [`NetMsg`] frames for the handshake,
//!   entity spawn/delete and ownership changes.
//! - Gameplay (UDP): binary [`Packet`]s carrying input batches and state
//!   snapshots in the layout defined by the wire codec.
//!
//! Datagram sending goes through the [`Transport`] trait so tests can swap
//! the socket for an in-memory or lossy channel.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Context;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    sync::mpsc,
};

use crate::{
    math::Vec3,
    state::{InputRecord, StateRecord},
    wire::{read_u32, read_u8, WireError, WireFormat},
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 2;

/// Most input commands carried by one datagram.
pub const MAX_INPUT_BATCH: usize = 32;

/// Largest control frame accepted, bytes.
const MAX_FRAME_LEN: usize = 1 << 20;

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn new_unique() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque networked entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u32);

/// Control-plane message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Connection handshake ───
    Hello {
        protocol: u32,
    },
    /// Client announces its UDP port to the server.
    UdpHello {
        client_udp_port: u16,
    },
    Welcome {
        client_id: ClientId,
        tick_hz: u32,
    },

    // ─── Entity lifecycle ───
    EntitySpawn(EntitySpawn),
    /// The entity's input owner changed. `None` means server-driven.
    OwnershipChanged {
        id: EntityId,
        owner: Option<ClientId>,
    },
    EntityDelete {
        id: EntityId,
    },

    // ─── Disconnect ───
    Disconnect {
        reason: String,
    },
}

/// Entity spawn packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySpawn {
    pub id: EntityId,
    pub owner: Option<ClientId>,
    pub position: Vec3,
}

/// Gameplay-plane datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet<I, S, D> {
    /// Client -> server: binds the sender's address to its client id.
    Hello { client_id: ClientId },
    /// Client -> server: newest unacknowledged commands, oldest first.
    Inputs {
        client_id: ClientId,
        entity: EntityId,
        inputs: Vec<I>,
    },
    /// Server -> client: full snapshot.
    Snapshot { entity: EntityId, state: S },
    /// Server -> client: snapshot relative to the last full one.
    Diff { entity: EntityId, diff: D },
}

const TAG_HELLO: u8 = 0x01;
const TAG_INPUTS: u8 = 0x02;
const TAG_SNAPSHOT: u8 = 0x03;
const TAG_DIFF: u8 = 0x04;

impl<I: WireFormat, S: WireFormat, D: WireFormat> WireFormat for Packet<I, S, D> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Packet::Hello { client_id } => {
                buf.put_u8(TAG_HELLO);
                buf.put_u32_le(client_id.0);
            }
            Packet::Inputs {
                client_id,
                entity,
                inputs,
            } => {
                buf.put_u8(TAG_INPUTS);
                buf.put_u32_le(client_id.0);
                buf.put_u32_le(entity.0);
                let count = inputs.len().min(MAX_INPUT_BATCH);
                buf.put_u8(count as u8);
                // Keep the newest commands if the caller passed too many.
                for input in &inputs[inputs.len() - count..] {
                    input.encode(buf);
                }
            }
            Packet::Snapshot { entity, state } => {
                buf.put_u8(TAG_SNAPSHOT);
                buf.put_u32_le(entity.0);
                state.encode(buf);
            }
            Packet::Diff { entity, diff } => {
                buf.put_u8(TAG_DIFF);
                buf.put_u32_le(entity.0);
                diff.encode(buf);
            }
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        match read_u8(buf, "packet.tag")? {
            TAG_HELLO => Ok(Packet::Hello {
                client_id: ClientId(read_u32(buf, "hello.client_id")?),
            }),
            TAG_INPUTS => {
                let client_id = ClientId(read_u32(buf, "inputs.client_id")?);
                let entity = EntityId(read_u32(buf, "inputs.entity")?);
                let count = read_u8(buf, "inputs.count")? as usize;
                if count > MAX_INPUT_BATCH {
                    return Err(WireError::BatchTooLarge(count));
                }
                let inputs = (0..count)
                    .map(|_| I::decode(buf))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Packet::Inputs {
                    client_id,
                    entity,
                    inputs,
                })
            }
            TAG_SNAPSHOT => Ok(Packet::Snapshot {
                entity: EntityId(read_u32(buf, "snapshot.entity")?),
                state: S::decode(buf)?,
            }),
            TAG_DIFF => Ok(Packet::Diff {
                entity: EntityId(read_u32(buf, "diff.entity")?),
                diff: D::decode(buf)?,
            }),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

/// Unreliable datagram sender.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, peer: SocketAddr, payload: Bytes) -> anyhow::Result<()>;
}

#[async_trait]
impl Transport for UdpSocket {
    async fn send_to(&self, peer: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
        UdpSocket::send_to(self, &payload, peer)
            .await
            .context("udp send")?;
        Ok(())
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send_to(&self, peer: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
        (**self).send_to(peer, payload).await
    }
}

/// Sends a batch of input commands for `entity`.
pub async fn send_input<T, I>(
    transport: &T,
    peer: SocketAddr,
    client_id: ClientId,
    entity: EntityId,
    inputs: &[I],
) -> anyhow::Result<()>
where
    T: Transport + ?Sized,
    I: InputRecord,
{
    if inputs.len() > MAX_INPUT_BATCH {
        return Err(WireError::BatchTooLarge(inputs.len()).into());
    }
    let mut buf = BytesMut::with_capacity(10 + inputs.len() * 24);
    buf.put_u8(TAG_INPUTS);
    buf.put_u32_le(client_id.0);
    buf.put_u32_le(entity.0);
    buf.put_u8(inputs.len() as u8);
    for input in inputs {
        input.encode(&mut buf);
    }
    transport.send_to(peer, buf.freeze()).await
}

/// Sends a full snapshot of `entity`.
pub async fn send_snapshot<T, S>(
    transport: &T,
    peer: SocketAddr,
    entity: EntityId,
    state: &S,
) -> anyhow::Result<()>
where
    T: Transport + ?Sized,
    S: StateRecord,
{
    let mut buf = BytesMut::with_capacity(80);
    buf.put_u8(TAG_SNAPSHOT);
    buf.put_u32_le(entity.0);
    state.encode(&mut buf);
    transport.send_to(peer, buf.freeze()).await
}

/// Sends a diff snapshot of `entity`.
pub async fn send_diff<T, D>(
    transport: &T,
    peer: SocketAddr,
    entity: EntityId,
    diff: &D,
) -> anyhow::Result<()>
where
    T: Transport + ?Sized,
    D: WireFormat,
{
    let mut buf = BytesMut::with_capacity(80);
    buf.put_u8(TAG_DIFF);
    buf.put_u32_le(entity.0);
    diff.encode(&mut buf);
    transport.send_to(peer, buf.freeze()).await
}

/// Sends the gameplay-plane hello that binds an address to a client id.
pub async fn send_hello<T: Transport + ?Sized>(
    transport: &T,
    peer: SocketAddr,
    client_id: ClientId,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(TAG_HELLO);
    buf.put_u32_le(client_id.0);
    transport.send_to(peer, buf.freeze()).await
}

type LoopbackRoutes = Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<(SocketAddr, Bytes)>>>>;

/// In-memory datagram network. Each endpoint gets a fake address and a
/// receiver of `(from, payload)` pairs.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    routes: LoopbackRoutes,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint at `addr`.
    pub fn endpoint(
        &self,
        addr: SocketAddr,
    ) -> (LoopbackTransport, mpsc::UnboundedReceiver<(SocketAddr, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(addr, tx);
        (
            LoopbackTransport {
                local: addr,
                routes: self.routes.clone(),
            },
            rx,
        )
    }
}

/// Sending half of a [`LoopbackNetwork`] endpoint.
#[derive(Clone)]
pub struct LoopbackTransport {
    local: SocketAddr,
    routes: LoopbackRoutes,
}

impl LoopbackTransport {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send_to(&self, peer: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
        let routes = self
            .routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Like UDP: sending to nobody is not an error.
        if let Some(tx) = routes.get(&peer) {
            let _ = tx.send((self.local, payload));
        }
        Ok(())
    }
}

/// Drops a fraction of outgoing datagrams, reproducibly for a given seed.
pub struct LossyTransport<T> {
    inner: T,
    loss: f64,
    rng: Mutex<StdRng>,
    dropped: AtomicU64,
}

impl<T: Transport> LossyTransport<T> {
    pub fn new(inner: T, loss: f64, seed: u64) -> Self {
        Self {
            inner,
            loss: loss.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<T: Transport> Transport for LossyTransport<T> {
    async fn send_to(&self, peer: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
        let drop_it = {
            let mut rng = self
                .rng
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.gen_bool(self.loss)
        };
        if drop_it {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.inner.send_to(peer, payload).await
    }
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.stream, msg).await
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.stream).await
    }

    /// Splits into halves so reading can run in its own task.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        let (read, write) = self.stream.into_split();
        (ReliableReader { read }, ReliableWriter { write })
    }
}

/// Receiving half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableReader {
    read: OwnedReadHalf,
}

impl ReliableReader {
    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.read).await
    }
}

/// Sending half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableWriter {
    write: OwnedWriteHalf,
}

impl ReliableWriter {
    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.write, msg).await
    }
}

async fn write_frame<W: AsyncWriteExt + Unpin>(w: &mut W, msg: &NetMsg) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    w.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> anyhow::Result<NetMsg> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_FRAME_LEN, "control frame of {len} bytes too large");
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
    Ok(msg)
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Control-plane codec helpers.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::move_state::{Buttons, MoveDiff, MoveInput, MoveState};

    type MovePacket = Packet<MoveInput, MoveState, MoveDiff>;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn input(n: u32) -> MoveInput {
        MoveInput {
            command_number: n,
            tick: n,
            move_x: 0.5,
            move_z: -1.0,
            yaw: 0.25,
            buttons: Buttons::JUMP,
        }
    }

    #[test]
    fn netmsg_roundtrip_bytes() {
        let msg = NetMsg::Hello {
            protocol: PROTOCOL_VERSION,
        };
        let bytes = encode_to_bytes(&msg).unwrap();
        let back = decode_from_bytes(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn packet_inputs_roundtrip() {
        let packet: MovePacket = Packet::Inputs {
            client_id: ClientId(3),
            entity: EntityId(11),
            inputs: (1..=4).map(input).collect(),
        };
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), 1 + 4 + 4 + 1 + 4 * 21);
        assert_eq!(MovePacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn oversized_batch_is_rejected_on_decode() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_INPUTS);
        buf.put_u32_le(1);
        buf.put_u32_le(1);
        buf.put_u8(200);
        assert_eq!(
            MovePacket::from_bytes(&buf),
            Err(WireError::BatchTooLarge(200))
        );
    }

    #[test]
    fn unknown_tag_and_trailing_bytes() {
        assert_eq!(MovePacket::from_bytes(&[0x7f]), Err(WireError::UnknownTag(0x7f)));

        let mut bytes = MovePacket::Hello {
            client_id: ClientId(1),
        }
        .to_bytes()
        .to_vec();
        bytes.push(0);
        assert_eq!(MovePacket::from_bytes(&bytes), Err(WireError::TrailingBytes(1)));
    }

    #[tokio::test]
    async fn send_helpers_match_packet_encoding() {
        let net = LoopbackNetwork::new();
        let (a, _rx_a) = net.endpoint(addr(1));
        let (_b, mut rx_b) = net.endpoint(addr(2));

        let inputs: Vec<_> = (5..=7).map(input).collect();
        send_input(&a, addr(2), ClientId(9), EntityId(4), &inputs)
            .await
            .unwrap();
        let (from, bytes) = rx_b.recv().await.unwrap();
        assert_eq!(from, addr(1));
        assert_eq!(
            MovePacket::from_bytes(&bytes).unwrap(),
            Packet::Inputs {
                client_id: ClientId(9),
                entity: EntityId(4),
                inputs,
            }
        );

        let state = MoveState::default();
        send_snapshot(&a, addr(2), EntityId(4), &state).await.unwrap();
        let (_, bytes) = rx_b.recv().await.unwrap();
        assert_eq!(
            MovePacket::from_bytes(&bytes).unwrap(),
            Packet::Snapshot {
                entity: EntityId(4),
                state,
            }
        );
    }

    #[tokio::test]
    async fn lossy_transport_drops_roughly_the_configured_share() {
        let net = LoopbackNetwork::new();
        let (a, _rx_a) = net.endpoint(addr(1));
        let (_b, mut rx_b) = net.endpoint(addr(2));
        let lossy = LossyTransport::new(a, 0.25, 7);

        for _ in 0..1000 {
            lossy
                .send_to(addr(2), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        let mut received = 0;
        while rx_b.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received + lossy.dropped(), 1000);
        assert!((150..350).contains(&lossy.dropped()));
    }
}
