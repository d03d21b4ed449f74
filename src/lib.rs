pub mod config;
pub mod file;
pub mod local;
pub mod multiplexer;
pub mod network;
pub mod packet;
pub mod pipe;
pub mod protocol;
pub mod types;

// Re-export only what's needed by external users
pub use config::ClusterConfig;
pub use file::ClusterFile;
pub use local::LocalCluster;
pub use multiplexer::{Multiplexer, Session};
pub use packet::{Packet, PacketPool};
pub use pipe::{Pipe, WireValue};
pub use protocol::ClusterNode;
pub use types::{AccessMode, ChannelId, ClusterError, ClusterMessage, GatherOp, NodeId, NodeInfo, NodeRole, Result};
