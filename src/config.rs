use crate::types::{ClusterError, NodeRole, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PACKET_CAPACITY: usize = 4096;
pub const MAX_PACKET_CAPACITY: usize = 1 << 20;
pub const DEFAULT_PORT: u16 = 26000;

/// Per-node settings for joining a cluster session.
///
/// `packet_capacity` must be identical on every node; the TCP handshake
/// refuses slaves that disagree with the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub role: NodeRole,
    pub master_addr: SocketAddr,
    pub slave_count: usize,
    pub packet_capacity: usize,
    /// Upper bound on packets loaned out at once. `None` is unbounded.
    pub max_packets: Option<usize>,
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Master,
            master_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            slave_count: 1,
            packet_capacity: DEFAULT_PACKET_CAPACITY,
            max_packets: None,
            connect_attempts: 50,
            connect_backoff_ms: 100,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.packet_capacity == 0 || self.packet_capacity > MAX_PACKET_CAPACITY {
            return Err(ClusterError::Config(format!(
                "packet capacity must be between 1 and {MAX_PACKET_CAPACITY}, got {}",
                self.packet_capacity
            )));
        }
        if self.max_packets == Some(0) {
            return Err(ClusterError::Config("max_packets must be at least 1".into()));
        }
        if self.connect_attempts == 0 {
            return Err(ClusterError::Config("connect_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    /// Defaults overridden by `CLUSTER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Like [`ClusterConfig::from_env`], reading from `vars` instead of the
    /// process environment. Unknown keys are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "CLUSTER_ROLE" => config.role = value.parse()?,
                "CLUSTER_MASTER_ADDR" => config.master_addr = parse(key, value)?,
                "CLUSTER_SLAVES" => config.slave_count = parse(key, value)?,
                "CLUSTER_PACKET_CAPACITY" => config.packet_capacity = parse(key, value)?,
                "CLUSTER_MAX_PACKETS" => config.max_packets = Some(parse(key, value)?),
                "CLUSTER_CONNECT_ATTEMPTS" => config.connect_attempts = parse(key, value)?,
                "CLUSTER_CONNECT_BACKOFF_MS" => config.connect_backoff_ms = parse(key, value)?,
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ClusterError::Config(format!("{key}={value:?}: {e}")))
}
