use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    serde::Serialize,
    serde::Deserialize,
    PartialEq,
    Eq,
    Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Master,
    Slave,
}

impl FromStr for NodeRole {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(NodeRole::Master),
            "slave" => Ok(NodeRole::Slave),
            other => Err(ClusterError::Config(format!("unknown node role {other:?}"))),
        }
    }
}

/// Identifies a pipe on a multiplexer. Ids are handed out in open order, so
/// matching pipes on every node get the same id as long as all nodes open
/// them in the same sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Associative operators accepted by `gather`.
#[derive(
    Debug,
    Clone,
    Copy,
    serde::Serialize,
    serde::Deserialize,
    PartialEq,
    Eq,
    rkyv::Archive,
    rkyv::Deserialize,
    rkyv::Serialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, PartialEq))]
pub enum GatherOp {
    Sum,
    Min,
    Max,
    /// Logical and: 1 if every contribution is non-zero.
    And,
    /// Logical or: 1 if any contribution is non-zero.
    Or,
}

impl GatherOp {
    pub fn combine(self, a: u64, b: u64) -> u64 {
        match self {
            GatherOp::Sum => a.wrapping_add(b),
            GatherOp::Min => a.min(b),
            GatherOp::Max => a.max(b),
            GatherOp::And => u64::from(a != 0 && b != 0),
            GatherOp::Or => u64::from(a != 0 || b != 0),
        }
    }
}

/// Frames exchanged between cluster nodes. The same values travel over
/// in-process links and, rkyv-encoded, over TCP.
#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug))]
pub enum ClusterMessage {
    // Session setup
    Hello {
        node_id: u128,
        packet_capacity: u32,
    },
    Welcome {
        slave_index: u32,
        slave_count: u32,
    },
    Goodbye,

    // Channel traffic, master to slaves
    Data {
        channel: u32,
        payload: Vec<u8>,
    },
    Fault {
        channel: u32,
        reason: String,
    },

    // Collectives
    BarrierEnter {
        channel: u32,
    },
    BarrierRelease {
        channel: u32,
    },
    GatherContribute {
        channel: u32,
        value: u64,
        op: GatherOp,
    },
    GatherResult {
        channel: u32,
        value: u64,
    },
    /// The master could not complete a collective, for example because the
    /// nodes disagreed on which one they entered.
    CollectiveFault {
        channel: u32,
        reason: String,
    },
}

impl ClusterMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "hello",
            ClusterMessage::Welcome { .. } => "welcome",
            ClusterMessage::Goodbye => "goodbye",
            ClusterMessage::Data { .. } => "data",
            ClusterMessage::Fault { .. } => "fault",
            ClusterMessage::BarrierEnter { .. } => "barrier-enter",
            ClusterMessage::BarrierRelease { .. } => "barrier-release",
            ClusterMessage::GatherContribute { .. } => "gather-contribute",
            ClusterMessage::GatherResult { .. } => "gather-result",
            ClusterMessage::CollectiveFault { .. } => "collective-fault",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub role: NodeRole,
    /// 0 for the master, 1..=N for slaves.
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeId(pub Uuid);

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeId {
    pub fn new() -> Self {
        NodeId(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a cluster file was opened. The same mode must be used on every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{operation} is not permitted on a {role:?} node")]
    RoleViolation {
        operation: &'static str,
        role: NodeRole,
    },
    #[error("{operation} is not permitted on a file opened {mode:?}")]
    AccessDenied {
        operation: &'static str,
        mode: AccessMode,
    },
    #[error("packet pool exhausted ({0} packets outstanding)")]
    PoolExhausted(usize),
    #[error("{len} bytes do not fit a packet of capacity {capacity}")]
    PacketOverflow { len: usize, capacity: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("master reported a failure on channel {channel}: {reason}")]
    RemoteFault { channel: ChannelId, reason: String },
    #[error("peer disconnected")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unexpected end of stream")]
    UnexpectedEof,
}

impl ClusterError {
    /// Errors caused by calling an operation from the wrong role or on a file
    /// opened without the needed access. These are programming errors, not
    /// runtime failures.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            ClusterError::RoleViolation { .. } | ClusterError::AccessDenied { .. }
        )
    }
}
