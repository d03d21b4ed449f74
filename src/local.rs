//! A whole cluster inside one process, wired with in-memory links.

use crate::config::ClusterConfig;
use crate::multiplexer::Session;
use crate::packet::PacketPool;
use crate::protocol::ClusterNode;
use crate::types::{ClusterMessage, Result};
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tracing::debug;

/// A master and `slave_count` slaves sharing one process. Each node has its
/// own packet pool, as separate processes would.
pub struct LocalCluster {
    pub master: Session<ClusterNode>,
    pub slaves: Vec<Session<ClusterNode>>,
}

impl LocalCluster {
    /// Must be called inside a tokio runtime.
    pub fn start(config: &ClusterConfig) -> Result<Self> {
        config.validate()?;
        let pool = || PacketPool::new(config.packet_capacity, config.max_packets);

        let (inbound_tx, inbound_rx) = unbounded_channel();
        let mut downlinks = Vec::with_capacity(config.slave_count);
        let mut slaves = Vec::with_capacity(config.slave_count);

        for index in 1..=config.slave_count {
            let (down_tx, down_rx) = unbounded_channel();
            let (up_tx, mut up_rx) = unbounded_channel::<ClusterMessage>();

            // Tag the slave's traffic with its index, and report its
            // departure once the slave node is gone.
            let inbound = inbound_tx.clone();
            tokio::spawn(async move {
                while let Some(message) = up_rx.recv().await {
                    if inbound.send((index, message)).is_err() {
                        return;
                    }
                }
                let _ = inbound.send((index, ClusterMessage::Goodbye));
            });

            downlinks.push(down_tx);
            slaves.push(Session::new(Arc::new(ClusterNode::slave(index, pool(), up_tx, down_rx))));
        }
        drop(inbound_tx);

        let master = Session::new(Arc::new(ClusterNode::master(pool(), downlinks, inbound_rx)));
        debug!(slaves = config.slave_count, capacity = config.packet_capacity, "local cluster started");

        Ok(Self { master, slaves })
    }
}
