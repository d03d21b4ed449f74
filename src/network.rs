use crate::config::ClusterConfig;
use crate::multiplexer::Session;
use crate::packet::PacketPool;
use crate::protocol::ClusterNode;
use crate::types::{ClusterError, ClusterMessage, NodeId, NodeRole, Result};
use futures::future::try_join_all;
use rkyv::{AlignedVec, Deserialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, info, warn};

/// Frames larger than this are treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 16 << 20;

/// Join the session described by `config`: masters wait for their slaves,
/// slaves connect to the master.
pub async fn join(config: ClusterConfig) -> Result<Session<ClusterNode>> {
    match config.role {
        NodeRole::Master => NetworkServer::bind(config).await?.start().await,
        NodeRole::Slave => NetworkClient::connect(&config).await,
    }
}

/// The master's listening side of a TCP session.
pub struct NetworkServer {
    listener: TcpListener,
    config: ClusterConfig,
}

impl NetworkServer {
    pub async fn bind(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.master_addr).await?;
        info!(address = %listener.local_addr()?, slaves = config.slave_count, "master listening");
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept exactly `slave_count` slaves, then start the session.
    pub async fn start(self) -> Result<Session<ClusterNode>> {
        let slave_count = self.config.slave_count;
        let mut sockets = Vec::with_capacity(slave_count);
        while sockets.len() < slave_count {
            let (socket, peer_addr) = self.listener.accept().await?;
            socket.set_nodelay(true)?;
            debug!(%peer_addr, "accepted slave connection");
            sockets.push(socket);
        }

        let capacity = self.config.packet_capacity;
        let handshakes = sockets
            .into_iter()
            .enumerate()
            .map(|(i, socket)| welcome(socket, i + 1, slave_count, capacity));
        let sockets = try_join_all(handshakes).await?;

        let (inbound_tx, inbound_rx) = unbounded_channel();
        let mut downlinks = Vec::with_capacity(slave_count);
        for (i, socket) in sockets.into_iter().enumerate() {
            let index = i + 1;
            let (reader, writer) = socket.into_split();
            let (down_tx, down_rx) = unbounded_channel();
            tokio::spawn(write_loop(writer, down_rx));

            let inbound = inbound_tx.clone();
            tokio::spawn(async move {
                read_loop(reader, |message| inbound.send((index, message)).is_ok()).await;
                let _ = inbound.send((index, ClusterMessage::Goodbye));
            });
            downlinks.push(down_tx);
        }

        let pool = PacketPool::new(capacity, self.config.max_packets);
        info!(slaves = slave_count, "cluster session started");
        Ok(Session::new(Arc::new(ClusterNode::master(pool, downlinks, inbound_rx))))
    }
}

async fn welcome(mut socket: TcpStream, slave_index: usize, slave_count: usize, capacity: usize) -> Result<TcpStream> {
    match read_frame(&mut socket).await? {
        Some(ClusterMessage::Hello { node_id, packet_capacity }) => {
            if packet_capacity as usize != capacity {
                return Err(ClusterError::Protocol(format!(
                    "slave {} uses packet capacity {packet_capacity}, session uses {capacity}",
                    NodeId(uuid::Uuid::from_u128(node_id))
                )));
            }
            let welcome = ClusterMessage::Welcome {
                slave_index: slave_index as u32,
                slave_count: slave_count as u32,
            };
            write_frame(&mut socket, &welcome).await?;
            debug!(slave = slave_index, node = %NodeId(uuid::Uuid::from_u128(node_id)), "slave joined");
            Ok(socket)
        }
        Some(other) => Err(ClusterError::Protocol(format!(
            "expected hello, got {}",
            other.kind()
        ))),
        None => Err(ClusterError::Disconnected),
    }
}

/// A slave's connection to the master.
pub struct NetworkClient;

impl NetworkClient {
    /// Connect to `config.master_addr`, retrying while the master is not yet
    /// listening.
    pub async fn connect(config: &ClusterConfig) -> Result<Session<ClusterNode>> {
        config.validate()?;
        let mut socket = connect_with_retry(config).await?;
        socket.set_nodelay(true)?;

        let node_id = NodeId::new();
        let hello = ClusterMessage::Hello {
            node_id: node_id.0.as_u128(),
            packet_capacity: u32::try_from(config.packet_capacity)
                .map_err(|_| ClusterError::Config("packet capacity does not fit u32".into()))?,
        };
        write_frame(&mut socket, &hello).await?;

        let slave_index = match read_frame(&mut socket).await? {
            Some(ClusterMessage::Welcome { slave_index, slave_count }) => {
                info!(slave = slave_index, slaves = slave_count, "joined cluster session");
                slave_index as usize
            }
            Some(other) => {
                return Err(ClusterError::Protocol(format!(
                    "expected welcome, got {}",
                    other.kind()
                )))
            }
            None => return Err(ClusterError::Disconnected),
        };

        let (reader, writer) = socket.into_split();
        let (up_tx, up_rx) = unbounded_channel();
        let (down_tx, down_rx) = unbounded_channel();
        tokio::spawn(write_loop(writer, up_rx));
        tokio::spawn(read_loop(reader, move |message| down_tx.send(message).is_ok()));

        let pool = PacketPool::new(config.packet_capacity, config.max_packets);
        Ok(Session::new(Arc::new(ClusterNode::slave(slave_index, pool, up_tx, down_rx))))
    }
}

async fn connect_with_retry(config: &ClusterConfig) -> Result<TcpStream> {
    let mut attempt = 1;
    loop {
        match TcpStream::connect(config.master_addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < config.connect_attempts => {
                debug!(attempt, error = %e, address = %config.master_addr, "master not reachable yet");
                attempt += 1;
                tokio::time::sleep(config.connect_backoff()).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: UnboundedReceiver<ClusterMessage>) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &message).await {
            warn!(error = %e, "failed to write frame, dropping link");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Hand every frame read from `reader` to `deliver` until the connection
/// ends or `deliver` returns false.
async fn read_loop(mut reader: OwnedReadHalf, mut deliver: impl FnMut(ClusterMessage) -> bool) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(message)) => {
                if !deliver(message) {
                    return;
                }
            }
            Ok(None) => {
                debug!("peer closed the connection");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read frame, dropping link");
                return;
            }
        }
    }
}

/// Write one frame: a little-endian u32 length followed by the rkyv archive.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &ClusterMessage) -> Result<()> {
    let bytes = rkyv::to_bytes::<_, 1024>(message)
        .map_err(|e| ClusterError::Protocol(format!("failed to encode {}: {e}", message.kind())))?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| ClusterError::Protocol(format!("frame of {} bytes is too large", bytes.len())))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` if the peer closed the stream between
/// frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<ClusterMessage>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ClusterError::Protocol(format!("frame of {len} bytes is too large")));
    }

    let mut buf = vec![0; len];
    reader.read_exact(&mut buf).await?;
    let mut aligned = AlignedVec::with_capacity(len);
    aligned.extend_from_slice(&buf);

    let archived = rkyv::check_archived_root::<ClusterMessage>(&aligned[..])
        .map_err(|e| ClusterError::Protocol(format!("invalid frame: {e}")))?;
    let message: ClusterMessage = archived
        .deserialize(&mut rkyv::Infallible)
        .unwrap_or_else(|never| match never {});
    Ok(Some(message))
}
