//! Role-aware byte streams over a [`Multiplexer`] channel.
//!
//! On the master a pipe cuts whatever is written into packets; on a slave it
//! stitches the received packets back into the same byte stream. Application
//! code that only uses the role-transparent calls (`broadcast*`, `barrier`,
//! `gather`) runs unchanged on every node.

use crate::multiplexer::{Multiplexer, Session};
use crate::packet::Packet;
use crate::types::{ChannelId, ClusterError, GatherOp, NodeRole, Result};
use tracing::{trace, warn};

/// Plain values with a fixed little-endian wire layout.
///
/// Both sides must agree out of band on what is sent; nothing about the type
/// travels with the bytes.
pub trait WireValue: Sized + Copy {
    const SIZE: usize;

    fn encode(self, out: &mut [u8]);

    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! wire_value {
    ($($ty:ty),*) => {$(
        impl WireValue for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn encode(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }

            fn decode(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..Self::SIZE]);
                <$ty>::from_le_bytes(raw)
            }
        }
    )*};
}

wire_value!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

impl WireValue for bool {
    const SIZE: usize = 1;

    fn encode(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Largest [`WireValue::SIZE`] of the types above.
const MAX_WIRE_SIZE: usize = 16;

/// Longest string accepted by [`Pipe::write_str`] and [`Pipe::read_string`].
/// A longer length prefix on the read side means the stream is out of step.
pub const MAX_STRING_LEN: usize = 16 << 20;

#[derive(Default)]
struct Outgoing {
    packet: Option<Packet>,
    cursor: usize,
}

#[derive(Default)]
struct Incoming {
    packet: Option<Packet>,
    cursor: usize,
    fault: Option<String>,
}

enum Stream {
    Master(Outgoing),
    Slave(Incoming),
}

/// A channel's byte stream as seen from this node.
///
/// Dropping a master pipe sends any bytes still sitting in a partially filled
/// packet before the channel is closed. Use [`Pipe::close`] to observe errors
/// from that final flush.
pub struct Pipe<M: Multiplexer> {
    session: Session<M>,
    channel: ChannelId,
    stream: Stream,
    open: bool,
}

impl<M: Multiplexer> Pipe<M> {
    pub fn open(session: &Session<M>) -> Result<Self> {
        let channel = session.multiplexer().open_pipe()?;
        let stream = match session.role() {
            NodeRole::Master => Stream::Master(Outgoing::default()),
            NodeRole::Slave => Stream::Slave(Incoming::default()),
        };
        Ok(Self {
            session: session.clone(),
            channel,
            stream,
            open: true,
        })
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn role(&self) -> NodeRole {
        match self.stream {
            Stream::Master(_) => NodeRole::Master,
            Stream::Slave(_) => NodeRole::Slave,
        }
    }

    pub fn session(&self) -> &Session<M> {
        &self.session
    }

    pub fn packet_capacity(&self) -> usize {
        self.session.packet_capacity()
    }

    fn outgoing(&mut self, operation: &'static str) -> Result<&mut Outgoing> {
        match &mut self.stream {
            Stream::Master(out) => Ok(out),
            Stream::Slave(_) => Err(ClusterError::RoleViolation {
                operation,
                role: NodeRole::Slave,
            }),
        }
    }

    fn incoming(&mut self, operation: &'static str) -> Result<&mut Incoming> {
        match &mut self.stream {
            Stream::Slave(input) => Ok(input),
            Stream::Master(_) => Err(ClusterError::RoleViolation {
                operation,
                role: NodeRole::Master,
            }),
        }
    }

    /// Master only. Appends `data` to the stream, sending every packet that
    /// fills up along the way.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let channel = self.channel;
        let mux = self.session.multiplexer();
        let out = match &mut self.stream {
            Stream::Master(out) => out,
            Stream::Slave(_) => {
                return Err(ClusterError::RoleViolation {
                    operation: "write_raw",
                    role: NodeRole::Slave,
                })
            }
        };

        let mut remaining = data;
        while !remaining.is_empty() {
            let mut packet = match out.packet.take() {
                Some(packet) => packet,
                None => {
                    out.cursor = 0;
                    mux.new_packet()?
                }
            };

            let n = remaining.len().min(packet.capacity() - out.cursor);
            packet.buffer_mut()[out.cursor..out.cursor + n].copy_from_slice(&remaining[..n]);
            out.cursor += n;
            packet.set_len(out.cursor)?;
            remaining = &remaining[n..];

            if packet.is_full() {
                mux.send_packet(channel, packet)?;
                out.cursor = 0;
            } else {
                out.packet = Some(packet);
            }
        }
        Ok(())
    }

    /// Slave only. Fills `data` from the stream, waiting for packets as
    /// needed.
    pub async fn read_raw(&mut self, data: &mut [u8]) -> Result<()> {
        let channel = self.channel;
        let mux = self.session.multiplexer();
        let input = match &mut self.stream {
            Stream::Slave(input) => input,
            Stream::Master(_) => {
                return Err(ClusterError::RoleViolation {
                    operation: "read_raw",
                    role: NodeRole::Master,
                })
            }
        };

        let mut filled = 0;
        while filled < data.len() {
            let packet = match input.packet.take() {
                Some(packet) => packet,
                None => {
                    input.cursor = 0;
                    receive(mux, channel, input).await?
                }
            };

            let n = (data.len() - filled).min(packet.len() - input.cursor);
            data[filled..filled + n].copy_from_slice(&packet.as_slice()[input.cursor..input.cursor + n]);
            input.cursor += n;
            filled += n;

            if input.cursor < packet.len() {
                input.packet = Some(packet);
            } else {
                mux.delete_packet(packet);
            }
        }
        Ok(())
    }

    /// Sends `data` from the master and overwrites it with the master's bytes
    /// on every slave.
    pub async fn broadcast_raw(&mut self, data: &mut [u8]) -> Result<()> {
        match self.stream {
            Stream::Master(_) => self.write_raw(data),
            Stream::Slave(_) => self.read_raw(data).await,
        }
    }

    /// Master only. Sends the partially filled packet now, so the next write
    /// starts a fresh packet.
    pub fn finish_message(&mut self) -> Result<()> {
        self.outgoing("finish_message")?;
        self.flush()
    }

    /// Master only. Sends `data` as exactly one packet, even when empty.
    /// Pending stream bytes are flushed first.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.outgoing("write_chunk")?;
        self.flush()?;
        let mux = self.session.multiplexer();
        let mut packet = mux.new_packet()?;
        packet.copy_from(data)?;
        mux.send_packet(self.channel, packet)
    }

    /// Slave only. Receives exactly one packet, as sent by
    /// [`Pipe::write_chunk`].
    pub async fn read_chunk(&mut self) -> Result<Packet> {
        let channel = self.channel;
        let mux = self.session.multiplexer();
        let input = match &mut self.stream {
            Stream::Slave(input) => input,
            Stream::Master(_) => {
                return Err(ClusterError::RoleViolation {
                    operation: "read_chunk",
                    role: NodeRole::Master,
                })
            }
        };
        if input.packet.is_some() {
            return Err(ClusterError::Protocol(format!(
                "chunk read on channel {channel} while a packet is partially drained"
            )));
        }
        receive(mux, channel, input).await
    }

    /// Blocks until every node reaches the barrier. The master flushes first,
    /// so the barrier never overtakes data written before it.
    pub async fn barrier(&mut self) -> Result<()> {
        self.flush()?;
        self.session.multiplexer().barrier(self.channel).await
    }

    /// Combines `value` from every node with `op`. The master flushes first.
    pub async fn gather(&mut self, value: u64, op: GatherOp) -> Result<u64> {
        self.flush()?;
        self.session.multiplexer().gather(self.channel, value, op).await
    }

    /// Master only. Flushes pending bytes, then tells every slave that this
    /// stream has failed. Slave reads on the channel fail with
    /// [`ClusterError::RemoteFault`] from then on.
    pub fn abort(&mut self, reason: &str) -> Result<()> {
        self.outgoing("abort")?;
        self.flush()?;
        self.session.multiplexer().send_fault(self.channel, reason)
    }

    pub fn write<T: WireValue>(&mut self, value: T) -> Result<()> {
        let mut raw = [0u8; MAX_WIRE_SIZE];
        value.encode(&mut raw);
        self.write_raw(&raw[..T::SIZE])
    }

    pub async fn read<T: WireValue>(&mut self) -> Result<T> {
        let mut raw = [0u8; MAX_WIRE_SIZE];
        self.read_raw(&mut raw[..T::SIZE]).await?;
        Ok(T::decode(&raw))
    }

    pub async fn broadcast<T: WireValue>(&mut self, value: &mut T) -> Result<()> {
        match self.stream {
            Stream::Master(_) => self.write(*value),
            Stream::Slave(_) => {
                *value = self.read().await?;
                Ok(())
            }
        }
    }

    pub fn write_slice<T: WireValue>(&mut self, values: &[T]) -> Result<()> {
        self.outgoing("write_slice")?;
        for value in values {
            self.write(*value)?;
        }
        Ok(())
    }

    pub async fn read_into<T: WireValue>(&mut self, values: &mut [T]) -> Result<()> {
        self.incoming("read_into")?;
        for value in values.iter_mut() {
            *value = self.read().await?;
        }
        Ok(())
    }

    /// Writes a u32 byte length followed by the UTF-8 bytes.
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        self.outgoing("write_str")?;
        if value.len() > MAX_STRING_LEN {
            return Err(ClusterError::Protocol(format!(
                "string of {} bytes is too long",
                value.len()
            )));
        }
        self.write(value.len() as u32)?;
        self.write_raw(value.as_bytes())
    }

    pub async fn read_string(&mut self) -> Result<String> {
        let len = self.read::<u32>().await? as usize;
        if len > MAX_STRING_LEN {
            return Err(ClusterError::Protocol(format!(
                "string length {len} on channel {} exceeds {MAX_STRING_LEN} bytes",
                self.channel
            )));
        }
        let mut raw = vec![0; len];
        self.read_raw(&mut raw).await?;
        String::from_utf8(raw).map_err(|e| ClusterError::Protocol(format!("invalid UTF-8 string: {e}")))
    }

    /// Flush and close the channel.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn flush(&mut self) -> Result<()> {
        let channel = self.channel;
        let mux = self.session.multiplexer();
        if let Stream::Master(out) = &mut self.stream {
            if let Some(packet) = out.packet.take() {
                out.cursor = 0;
                if !packet.is_empty() {
                    trace!(%channel, len = packet.len(), "flushing partial packet");
                    mux.send_packet(channel, packet)?;
                }
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let flushed = self.flush();
        if let Stream::Slave(input) = &mut self.stream {
            input.packet = None;
        }
        let closed = self.session.multiplexer().close_pipe(self.channel);
        flushed.and(closed)
    }
}

/// Wait for the next packet of `channel`, latching a fault so that every
/// later read reports it too.
async fn receive<M: Multiplexer>(mux: &M, channel: ChannelId, input: &mut Incoming) -> Result<Packet> {
    if let Some(reason) = &input.fault {
        return Err(ClusterError::RemoteFault {
            channel,
            reason: reason.clone(),
        });
    }
    match mux.receive_packet(channel).await {
        Err(ClusterError::RemoteFault { channel, reason }) => {
            input.fault = Some(reason.clone());
            Err(ClusterError::RemoteFault { channel, reason })
        }
        other => other,
    }
}

impl<M: Multiplexer> Drop for Pipe<M> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(channel = %self.channel, error = %e, "failed to flush pipe on drop");
        }
    }
}
