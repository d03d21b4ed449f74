//! The transport contract pipes are layered on, and the session handle that
//! carries it.

use crate::file::ClusterFile;
use crate::packet::{Packet, PacketPool};
use crate::pipe::Pipe;
use crate::types::{AccessMode, ChannelId, GatherOp, NodeId, NodeRole, Result};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// Moves packets between the master and its slaves and implements the
/// cluster-wide collectives.
///
/// Implementations must deliver the packets of one channel to every slave in
/// the order the master sent them, and must never let a collective release
/// overtake data sent on the same channel before it.
pub trait Multiplexer: Send + Sync + 'static {
    fn node_id(&self) -> NodeId;

    /// Fixed for the whole session.
    fn role(&self) -> NodeRole;

    fn is_master(&self) -> bool {
        self.role() == NodeRole::Master
    }

    fn packet_pool(&self) -> &PacketPool;

    fn new_packet(&self) -> Result<Packet> {
        self.packet_pool().allocate()
    }

    fn delete_packet(&self, packet: Packet) {
        self.packet_pool().release(packet)
    }

    fn open_pipe(&self) -> Result<ChannelId>;

    fn close_pipe(&self, channel: ChannelId) -> Result<()>;

    /// Master only. Queues `packet` for delivery to every slave.
    fn send_packet(&self, channel: ChannelId, packet: Packet) -> Result<()>;

    /// Master only. Tells every slave that no further data will arrive on
    /// `channel` because of `reason`.
    fn send_fault(&self, channel: ChannelId, reason: &str) -> Result<()>;

    /// Slave only. Waits for the next packet on `channel`.
    fn receive_packet(&self, channel: ChannelId) -> impl Future<Output = Result<Packet>> + Send;

    /// Blocks until every node has entered the barrier on `channel`.
    fn barrier(&self, channel: ChannelId) -> impl Future<Output = Result<()>> + Send;

    /// Combines one value per node with `op`; every node gets the same result.
    fn gather(
        &self,
        channel: ChannelId,
        value: u64,
        op: GatherOp,
    ) -> impl Future<Output = Result<u64>> + Send;
}

/// The explicit context a node's pipes and files are opened against.
pub struct Session<M: Multiplexer> {
    mux: Arc<M>,
}

impl<M: Multiplexer> Clone for Session<M> {
    fn clone(&self) -> Self {
        Self {
            mux: Arc::clone(&self.mux),
        }
    }
}

impl<M: Multiplexer> Session<M> {
    pub fn new(mux: Arc<M>) -> Self {
        Self { mux }
    }

    pub fn multiplexer(&self) -> &M {
        &self.mux
    }

    pub fn role(&self) -> NodeRole {
        self.mux.role()
    }

    pub fn is_master(&self) -> bool {
        self.mux.is_master()
    }

    pub fn node_id(&self) -> NodeId {
        self.mux.node_id()
    }

    pub fn packet_capacity(&self) -> usize {
        self.mux.packet_pool().capacity()
    }

    pub fn open_pipe(&self) -> Result<Pipe<M>> {
        Pipe::open(self)
    }

    pub async fn open_file(&self, path: impl AsRef<Path>, mode: AccessMode) -> Result<ClusterFile<M>> {
        ClusterFile::open(self, path, mode).await
    }
}
