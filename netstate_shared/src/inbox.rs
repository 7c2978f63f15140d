//! Inbound message queues.
//!
//! Network receive runs in spawned tasks that only decode datagrams and push
//! them into one unbounded queue per message kind. The simulation loop drains
//! the queues at tick boundaries, so received commands and snapshots are
//! never applied from inside a network callback.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    net::{ClientId, EntityId, NetMsg, Packet, ReliableReader},
    wire::{WireError, WireFormat},
};

/// Largest datagram read from the socket.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Input batch received by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct InputDelivery<I> {
    pub from: SocketAddr,
    pub client_id: ClientId,
    pub entity: EntityId,
    pub inputs: Vec<I>,
}

/// Snapshot received by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDelivery<S, D> {
    pub from: SocketAddr,
    pub entity: EntityId,
    pub update: SnapshotUpdate<S, D>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotUpdate<S, D> {
    Full(S),
    Diff(D),
}

/// Connection-level events of the gameplay plane.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlDelivery {
    Hello { from: SocketAddr, client_id: ClientId },
    /// A datagram failed to decode. Nothing from it was queued.
    Malformed { from: SocketAddr, error: WireError },
}

/// Producer side, owned by the receive task.
pub struct InboxSenders<I, S, D> {
    inputs: UnboundedSender<InputDelivery<I>>,
    snapshots: UnboundedSender<SnapshotDelivery<S, D>>,
    control: UnboundedSender<ControlDelivery>,
}

impl<I, S, D> Clone for InboxSenders<I, S, D> {
    fn clone(&self) -> Self {
        Self {
            inputs: self.inputs.clone(),
            snapshots: self.snapshots.clone(),
            control: self.control.clone(),
        }
    }
}

/// Consumer side, drained by the tick loop.
pub struct Inboxes<I, S, D> {
    pub inputs: UnboundedReceiver<InputDelivery<I>>,
    pub snapshots: UnboundedReceiver<SnapshotDelivery<S, D>>,
    pub control: UnboundedReceiver<ControlDelivery>,
}

/// Creates a connected sender/receiver set.
pub fn inboxes<I, S, D>() -> (InboxSenders<I, S, D>, Inboxes<I, S, D>) {
    let (inputs_tx, inputs) = mpsc::unbounded_channel();
    let (snapshots_tx, snapshots) = mpsc::unbounded_channel();
    let (control_tx, control) = mpsc::unbounded_channel();
    (
        InboxSenders {
            inputs: inputs_tx,
            snapshots: snapshots_tx,
            control: control_tx,
        },
        Inboxes {
            inputs,
            snapshots,
            control,
        },
    )
}

impl<I: WireFormat, S: WireFormat, D: WireFormat> InboxSenders<I, S, D> {
    /// Decodes one datagram and routes it. Returns `false` once the
    /// consumer side is gone.
    pub fn deliver(&self, from: SocketAddr, datagram: &[u8]) -> bool {
        let sent = match Packet::<I, S, D>::from_bytes(datagram) {
            Ok(Packet::Hello { client_id }) => self
                .control
                .send(ControlDelivery::Hello { from, client_id })
                .is_ok(),
            Ok(Packet::Inputs {
                client_id,
                entity,
                inputs,
            }) => self
                .inputs
                .send(InputDelivery {
                    from,
                    client_id,
                    entity,
                    inputs,
                })
                .is_ok(),
            Ok(Packet::Snapshot { entity, state }) => self
                .snapshots
                .send(SnapshotDelivery {
                    from,
                    entity,
                    update: SnapshotUpdate::Full(state),
                })
                .is_ok(),
            Ok(Packet::Diff { entity, diff }) => self
                .snapshots
                .send(SnapshotDelivery {
                    from,
                    entity,
                    update: SnapshotUpdate::Diff(diff),
                })
                .is_ok(),
            Err(error) => {
                debug!(%from, %error, "Malformed datagram");
                self.control
                    .send(ControlDelivery::Malformed { from, error })
                    .is_ok()
            }
        };
        sent || !self.control.is_closed()
    }
}

/// Receive task handle; aborts the task when dropped.
#[derive(Debug)]
pub struct ReceiverTask(JoinHandle<()>);

impl Drop for ReceiverTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawns a task that reads datagrams from `socket` into the inboxes.
pub fn spawn_udp_receiver<I, S, D>(
    socket: Arc<UdpSocket>,
    senders: InboxSenders<I, S, D>,
) -> ReceiverTask
where
    I: WireFormat + Send + 'static,
    S: WireFormat + Send + 'static,
    D: WireFormat + Send + 'static,
{
    ReceiverTask(tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    if !senders.deliver(from, &buf[..n]) {
                        break;
                    }
                }
                // Connection-reset style errors are per datagram on UDP.
                Err(e) => warn!(error = %e, "udp recv"),
            }
        }
    }))
}

/// Spawns a task that feeds an in-memory datagram channel into the inboxes.
pub fn spawn_channel_receiver<I, S, D>(
    mut rx: UnboundedReceiver<(SocketAddr, Bytes)>,
    senders: InboxSenders<I, S, D>,
) -> ReceiverTask
where
    I: WireFormat + Send + 'static,
    S: WireFormat + Send + 'static,
    D: WireFormat + Send + 'static,
{
    ReceiverTask(tokio::spawn(async move {
        while let Some((from, datagram)) = rx.recv().await {
            if !senders.deliver(from, &datagram) {
                break;
            }
        }
    }))
}

/// Spawns a task that reads control frames and tags them with `key`.
/// A read error is forwarded once and ends the task.
pub fn spawn_control_reader<K>(
    key: K,
    mut reader: ReliableReader,
    tx: UnboundedSender<(K, anyhow::Result<NetMsg>)>,
) -> ReceiverTask
where
    K: Copy + Send + 'static,
{
    ReceiverTask(tokio::spawn(async move {
        loop {
            let msg = reader.recv().await;
            let failed = msg.is_err();
            if tx.send((key, msg)).is_err() || failed {
                break;
            }
        }
    }))
}

/// Takes everything currently queued without waiting.
pub fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::move_state::{MoveDiff, MoveInput, MoveState};
    use crate::state::InputRecord;

    fn from() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    #[test]
    fn datagrams_are_routed_by_kind() {
        let (tx, mut rx) = inboxes::<MoveInput, MoveState, MoveDiff>();

        let inputs = Packet::<MoveInput, MoveState, MoveDiff>::Inputs {
            client_id: ClientId(1),
            entity: EntityId(2),
            inputs: vec![MoveInput::empty(1, 1)],
        };
        assert!(tx.deliver(from(), &inputs.to_bytes()));

        let snap = Packet::<MoveInput, MoveState, MoveDiff>::Snapshot {
            entity: EntityId(2),
            state: MoveState::default(),
        };
        assert!(tx.deliver(from(), &snap.to_bytes()));

        assert_eq!(drain(&mut rx.inputs).len(), 1);
        let snaps = drain(&mut rx.snapshots);
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].update, SnapshotUpdate::Full(MoveState::default()));
        assert!(drain(&mut rx.control).is_empty());
    }

    #[test]
    fn truncated_datagram_is_reported_not_applied() {
        let (tx, mut rx) = inboxes::<MoveInput, MoveState, MoveDiff>();
        let snap = Packet::<MoveInput, MoveState, MoveDiff>::Snapshot {
            entity: EntityId(2),
            state: MoveState::default(),
        }
        .to_bytes();

        assert!(tx.deliver(from(), &snap[..snap.len() - 3]));
        assert!(drain(&mut rx.snapshots).is_empty());
        match drain(&mut rx.control).as_slice() {
            [ControlDelivery::Malformed { from: f, error }] => {
                assert_eq!(*f, from());
                assert!(matches!(error, WireError::Truncated { .. }));
            }
            other => panic!("unexpected control events: {other:?}"),
        }
    }

    #[test]
    fn deliver_reports_closed_consumer() {
        let (tx, rx) = inboxes::<MoveInput, MoveState, MoveDiff>();
        drop(rx);
        assert!(!tx.deliver(from(), &[0xff]));
    }
}
