use crate::multiplexer::Multiplexer;
use crate::packet::{Packet, PacketPool};
use crate::types::{ChannelId, ClusterError, ClusterMessage, GatherOp, NodeId, NodeInfo, NodeRole, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};

/// What a slave's dispatcher hands to a waiting pipe.
#[derive(Debug)]
pub(crate) enum Delivery {
    Packet(Vec<u8>),
    Fault(String),
}

/// Collective traffic queued per channel. The master sees slave arrivals,
/// slaves see the master's answers.
#[derive(Debug)]
pub(crate) enum Collective {
    Barrier { from: usize },
    Gather { from: usize, value: u64, op: GatherOp },
    Released,
    Gathered(u64),
    Failed(String),
}

struct Queue<T> {
    tx: Option<UnboundedSender<T>>,
    rx: Arc<AsyncMutex<UnboundedReceiver<T>>>,
}

impl<T> Queue<T> {
    fn new(open: bool) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            tx: open.then_some(tx),
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }

    fn push(&self, item: T) {
        if let Some(tx) = &self.tx {
            // The receiver lives in the same struct, so this cannot fail.
            let _ = tx.send(item);
        }
    }
}

struct ChannelQueues {
    data: Queue<Delivery>,
    collective: Queue<Collective>,
}

impl ChannelQueues {
    fn new(open: bool) -> Self {
        Self {
            data: Queue::new(open),
            collective: Queue::new(open),
        }
    }
}

#[derive(Default)]
struct TableState {
    channels: HashMap<ChannelId, ChannelQueues>,
    /// Every channel below this id is closed.
    closed_below: u32,
    /// Closed channels at or above `closed_below`.
    closed: BTreeSet<u32>,
    shut_down: bool,
}

impl TableState {
    fn is_closed(&self, channel: ChannelId) -> bool {
        channel.0 < self.closed_below || self.closed.contains(&channel.0)
    }

    fn mark_closed(&mut self, channel: ChannelId) {
        if channel.0 < self.closed_below {
            return;
        }
        self.closed.insert(channel.0);
        while self.closed.remove(&self.closed_below) {
            self.closed_below += 1;
        }
    }

    fn queues(&mut self, channel: ChannelId) -> &mut ChannelQueues {
        let open = !self.shut_down;
        self.channels
            .entry(channel)
            .or_insert_with(|| ChannelQueues::new(open))
    }
}

/// Per-channel inboxes of one node. Traffic for a channel that has not been
/// opened yet is kept until the pipe shows up.
#[derive(Default)]
pub(crate) struct ChannelTable {
    state: Mutex<TableState>,
}

impl ChannelTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn deliver(&self, channel: ChannelId, delivery: Delivery) {
        let mut state = self.lock();
        if state.is_closed(channel) {
            debug!(%channel, "dropping delivery for closed channel");
            return;
        }
        state.queues(channel).data.push(delivery);
    }

    pub(crate) fn collect(&self, channel: ChannelId, collective: Collective) {
        let mut state = self.lock();
        if state.is_closed(channel) {
            debug!(%channel, "dropping collective for closed channel");
            return;
        }
        state.queues(channel).collective.push(collective);
    }

    pub(crate) async fn next_delivery(&self, channel: ChannelId) -> Result<Delivery> {
        let rx = Arc::clone(&self.lock().queues(channel).data.rx);
        let mut rx = rx.lock().await;
        rx.recv().await.ok_or(ClusterError::Disconnected)
    }

    pub(crate) async fn next_collective(&self, channel: ChannelId) -> Result<Collective> {
        let rx = Arc::clone(&self.lock().queues(channel).collective.rx);
        let mut rx = rx.lock().await;
        rx.recv().await.ok_or(ClusterError::Disconnected)
    }

    pub(crate) fn close(&self, channel: ChannelId) {
        let mut state = self.lock();
        state.channels.remove(&channel);
        state.mark_closed(channel);
    }

    /// Stop accepting traffic. Whatever is already queued stays readable,
    /// after which every wait reports [`ClusterError::Disconnected`].
    pub(crate) fn shutdown(&self) {
        let mut state = self.lock();
        state.shut_down = true;
        for queues in state.channels.values_mut() {
            queues.data.tx = None;
            queues.collective.tx = None;
        }
    }
}

enum Links {
    Master {
        slaves: Vec<UnboundedSender<ClusterMessage>>,
    },
    Slave {
        master: UnboundedSender<ClusterMessage>,
    },
}

/// A cluster node: the [`Multiplexer`] implementation that moves packets and
/// collectives over ordered links to its peers.
///
/// The master owns one outbound link per slave and a single inbound link
/// carrying `(slave index, message)` pairs; a slave owns one link in each
/// direction. Whoever builds the links (in-process wiring or the TCP layer)
/// only has to preserve message order per link.
pub struct ClusterNode {
    /// Node's own information
    pub info: NodeInfo,

    pool: PacketPool,

    next_channel: AtomicU32,

    channels: Arc<ChannelTable>,

    links: Links,
}

impl ClusterNode {
    /// Create the master node. Must be called inside a tokio runtime; the
    /// inbound link is drained by a background task.
    pub fn master(
        pool: PacketPool,
        slaves: Vec<UnboundedSender<ClusterMessage>>,
        inbound: UnboundedReceiver<(usize, ClusterMessage)>,
    ) -> Self {
        let channels = Arc::new(ChannelTable::default());
        tokio::spawn(dispatch_master(Arc::clone(&channels), inbound));

        ClusterNode {
            info: NodeInfo {
                id: NodeId::new(),
                role: NodeRole::Master,
                index: 0,
            },
            pool,
            next_channel: AtomicU32::new(0),
            channels,
            links: Links::Master { slaves },
        }
    }

    /// Create a slave node. `index` counts from 1.
    pub fn slave(
        index: usize,
        pool: PacketPool,
        master: UnboundedSender<ClusterMessage>,
        inbound: UnboundedReceiver<ClusterMessage>,
    ) -> Self {
        let channels = Arc::new(ChannelTable::default());
        tokio::spawn(dispatch_slave(Arc::clone(&channels), inbound));

        ClusterNode {
            info: NodeInfo {
                id: NodeId::new(),
                role: NodeRole::Slave,
                index,
            },
            pool,
            next_channel: AtomicU32::new(0),
            channels,
            links: Links::Slave { master },
        }
    }

    /// Number of slaves this master serves; 0 on slaves.
    pub fn slave_count(&self) -> usize {
        match &self.links {
            Links::Master { slaves } => slaves.len(),
            Links::Slave { .. } => 0,
        }
    }

    fn broadcast(&self, message: ClusterMessage) -> Result<()> {
        let Links::Master { slaves } = &self.links else {
            return Err(self.role_violation(message.kind()));
        };
        for slave in slaves {
            slave
                .send(message.clone())
                .map_err(|_| ClusterError::Disconnected)?;
        }
        Ok(())
    }

    fn send_to_master(&self, message: ClusterMessage) -> Result<()> {
        let Links::Slave { master } = &self.links else {
            return Err(self.role_violation(message.kind()));
        };
        master.send(message).map_err(|_| ClusterError::Disconnected)
    }

    fn role_violation(&self, operation: &'static str) -> ClusterError {
        ClusterError::RoleViolation {
            operation,
            role: self.info.role,
        }
    }

    /// Wait for every slave's contribution to the current collective on
    /// `channel` and fold it into `acc`. `op` is `None` for a barrier.
    ///
    /// Every slave's contribution is consumed even after a mismatch, and the
    /// slaves are told the collective failed instead of being released.
    async fn collect_slaves(&self, channel: ChannelId, op: Option<GatherOp>, mut acc: u64) -> Result<u64> {
        let mut mismatch = None;
        for _ in 0..self.slave_count() {
            match (self.channels.next_collective(channel).await?, op) {
                (Collective::Barrier { from }, None) => {
                    trace!(%channel, slave = from, "slave entered barrier");
                }
                (Collective::Gather { from, value, op: theirs }, Some(ours)) if theirs == ours => {
                    trace!(%channel, slave = from, value, "slave contributed to gather");
                    acc = ours.combine(acc, value);
                }
                (other, _) => {
                    mismatch.get_or_insert_with(|| {
                        format!("mismatched collective on channel {channel}: expected {op:?}, got {other:?}")
                    });
                }
            }
        }

        match mismatch {
            None => Ok(acc),
            Some(reason) => {
                warn!(%channel, %reason, "collective failed");
                self.broadcast(ClusterMessage::CollectiveFault {
                    channel: channel.0,
                    reason: reason.clone(),
                })?;
                Err(ClusterError::Protocol(reason))
            }
        }
    }

    /// Slave side of a collective: wait for the master's answer.
    async fn await_answer(&self, channel: ChannelId) -> Result<Collective> {
        match self.channels.next_collective(channel).await? {
            Collective::Failed(reason) => Err(ClusterError::RemoteFault { channel, reason }),
            answer => Ok(answer),
        }
    }
}

impl Multiplexer for ClusterNode {
    fn node_id(&self) -> NodeId {
        self.info.id
    }

    fn role(&self) -> NodeRole {
        self.info.role
    }

    fn packet_pool(&self) -> &PacketPool {
        &self.pool
    }

    fn open_pipe(&self) -> Result<ChannelId> {
        let channel = ChannelId(self.next_channel.fetch_add(1, Ordering::AcqRel));
        debug!(%channel, node = self.info.index, "opened pipe");
        Ok(channel)
    }

    fn close_pipe(&self, channel: ChannelId) -> Result<()> {
        self.channels.close(channel);
        debug!(%channel, node = self.info.index, "closed pipe");
        Ok(())
    }

    fn send_packet(&self, channel: ChannelId, packet: Packet) -> Result<()> {
        trace!(%channel, len = packet.len(), "sending packet");
        self.broadcast(ClusterMessage::Data {
            channel: channel.0,
            payload: packet.as_slice().to_vec(),
        })
    }

    fn send_fault(&self, channel: ChannelId, reason: &str) -> Result<()> {
        warn!(%channel, reason, "signalling fault to slaves");
        self.broadcast(ClusterMessage::Fault {
            channel: channel.0,
            reason: reason.to_string(),
        })
    }

    async fn receive_packet(&self, channel: ChannelId) -> Result<Packet> {
        if self.info.role != NodeRole::Slave {
            return Err(self.role_violation("receive_packet"));
        }
        match self.channels.next_delivery(channel).await? {
            Delivery::Packet(payload) => {
                let mut packet = self.pool.allocate()?;
                packet.copy_from(&payload)?;
                trace!(%channel, len = packet.len(), "received packet");
                Ok(packet)
            }
            Delivery::Fault(reason) => Err(ClusterError::RemoteFault { channel, reason }),
        }
    }

    async fn barrier(&self, channel: ChannelId) -> Result<()> {
        match self.info.role {
            NodeRole::Master => {
                self.collect_slaves(channel, None, 0).await?;
                self.broadcast(ClusterMessage::BarrierRelease { channel: channel.0 })?;
                debug!(%channel, "barrier released");
                Ok(())
            }
            NodeRole::Slave => {
                self.send_to_master(ClusterMessage::BarrierEnter { channel: channel.0 })?;
                match self.await_answer(channel).await? {
                    Collective::Released => Ok(()),
                    other => Err(ClusterError::Protocol(format!(
                        "expected barrier release on channel {channel}, got {other:?}"
                    ))),
                }
            }
        }
    }

    async fn gather(&self, channel: ChannelId, value: u64, op: GatherOp) -> Result<u64> {
        match self.info.role {
            NodeRole::Master => {
                let result = self.collect_slaves(channel, Some(op), value).await?;
                self.broadcast(ClusterMessage::GatherResult {
                    channel: channel.0,
                    value: result,
                })?;
                debug!(%channel, ?op, result, "gather complete");
                Ok(result)
            }
            NodeRole::Slave => {
                self.send_to_master(ClusterMessage::GatherContribute {
                    channel: channel.0,
                    value,
                    op,
                })?;
                match self.await_answer(channel).await? {
                    Collective::Gathered(result) => Ok(result),
                    other => Err(ClusterError::Protocol(format!(
                        "expected gather result on channel {channel}, got {other:?}"
                    ))),
                }
            }
        }
    }
}

async fn dispatch_master(
    channels: Arc<ChannelTable>,
    mut inbound: UnboundedReceiver<(usize, ClusterMessage)>,
) {
    while let Some((from, message)) = inbound.recv().await {
        match message {
            ClusterMessage::BarrierEnter { channel } => {
                channels.collect(ChannelId(channel), Collective::Barrier { from })
            }
            ClusterMessage::GatherContribute { channel, value, op } => {
                channels.collect(ChannelId(channel), Collective::Gather { from, value, op })
            }
            ClusterMessage::Goodbye => {
                warn!(slave = from, "slave left the session");
                break;
            }
            other => warn!(slave = from, kind = other.kind(), "unexpected message from slave"),
        }
    }
    channels.shutdown();
}

async fn dispatch_slave(channels: Arc<ChannelTable>, mut inbound: UnboundedReceiver<ClusterMessage>) {
    while let Some(message) = inbound.recv().await {
        match message {
            ClusterMessage::Data { channel, payload } => {
                channels.deliver(ChannelId(channel), Delivery::Packet(payload))
            }
            ClusterMessage::Fault { channel, reason } => {
                channels.deliver(ChannelId(channel), Delivery::Fault(reason))
            }
            ClusterMessage::BarrierRelease { channel } => {
                channels.collect(ChannelId(channel), Collective::Released)
            }
            ClusterMessage::GatherResult { channel, value } => {
                channels.collect(ChannelId(channel), Collective::Gathered(value))
            }
            ClusterMessage::CollectiveFault { channel, reason } => {
                channels.collect(ChannelId(channel), Collective::Failed(reason))
            }
            ClusterMessage::Goodbye => break,
            other => warn!(kind = other.kind(), "unexpected message from master"),
        }
    }
    debug!("master link closed");
    channels.shutdown();
}
