//! Files whose reads happen once, on the master, and are replayed on every
//! slave through a pipe.
//!
//! The read buffer of a cluster file is always exactly one packet's worth: the
//! master fills it from disk and forwards it as one chunk, and a slave's buffer
//! *is* the packet it received. A zero-length packet marks end of file.
//!
//! Each side holds at most one pool packet per file at a time, so a pool
//! limit of one packet per open file is enough.

use crate::multiplexer::{Multiplexer, Session};
use crate::packet::Packet;
use crate::pipe::Pipe;
use crate::types::{AccessMode, ClusterError, NodeRole, Result};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const OPEN_OK: u8 = 1;

struct ReadBuffer<B> {
    data: Option<B>,
    cursor: usize,
    eof: bool,
}

impl<B> Default for ReadBuffer<B> {
    fn default() -> Self {
        Self {
            data: None,
            cursor: 0,
            eof: false,
        }
    }
}

impl<B: AsRef<[u8]>> ReadBuffer<B> {
    fn needs_refill(&self) -> bool {
        !self.eof && self.remaining().is_empty()
    }

    fn remaining(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data.as_ref()[self.cursor..],
            None => &[],
        }
    }

    fn refill(&mut self, data: B) {
        self.eof = data.as_ref().is_empty();
        self.cursor = 0;
        self.data = Some(data);
    }

    fn consume(&mut self, out: &mut [u8]) -> usize {
        let available = self.remaining();
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.cursor += n;
        n
    }

    /// Drop the buffered data, handing back its storage.
    fn take(&mut self) -> Option<B> {
        self.cursor = 0;
        self.eof = false;
        self.data.take()
    }

    fn discard(&mut self) {
        self.take();
    }
}

/// The master's side: a real file plus the pipe its reads are forwarded on.
pub struct MasterFile<M: Multiplexer> {
    pipe: Pipe<M>,
    file: File,
    path: PathBuf,
    mode: AccessMode,
    buffer: ReadBuffer<Vec<u8>>,
}

/// A slave's side: no file at all, only the forwarded reads.
pub struct SlaveFile<M: Multiplexer> {
    pipe: Pipe<M>,
    path: PathBuf,
    mode: AccessMode,
    buffer: ReadBuffer<Packet>,
}

/// A cluster-transparent file.
///
/// Every node opens the same path with the same mode, in the same order
/// relative to its other pipes, and then issues the same sequence of reads,
/// seeks and size queries. Writes only reach the disk on the master.
pub enum ClusterFile<M: Multiplexer> {
    Master(MasterFile<M>),
    Slave(SlaveFile<M>),
}

impl<M: Multiplexer> ClusterFile<M> {
    /// Open `path` on every node. The master's open result is shared with the
    /// slaves, so a missing file fails everywhere instead of leaving slaves
    /// waiting for data.
    pub async fn open(session: &Session<M>, path: impl AsRef<Path>, mode: AccessMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut pipe = Pipe::open(session)?;

        match session.role() {
            NodeRole::Master => match open_options(mode).open(&path).await {
                Ok(file) => {
                    if let Err(e) = pipe.write(OPEN_OK).and_then(|()| pipe.finish_message()) {
                        warn!(path = %path.display(), error = %e, "cannot announce cluster file");
                        pipe.abort(&format!("cannot open {}: {e}", path.display()))?;
                        return Err(e);
                    }
                    info!(path = %path.display(), ?mode, channel = %pipe.channel(), "opened cluster file");
                    Ok(ClusterFile::Master(MasterFile {
                        pipe,
                        file,
                        path,
                        mode,
                        buffer: ReadBuffer::default(),
                    }))
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot open cluster file");
                    pipe.abort(&format!("cannot open {}: {e}", path.display()))?;
                    pipe.close()?;
                    Err(e.into())
                }
            },
            NodeRole::Slave => {
                let status: u8 = pipe.read().await?;
                if status != OPEN_OK {
                    return Err(ClusterError::Protocol(format!(
                        "unexpected open status {status} for {}",
                        path.display()
                    )));
                }
                debug!(path = %path.display(), ?mode, channel = %pipe.channel(), "attached to cluster file");
                Ok(ClusterFile::Slave(SlaveFile {
                    pipe,
                    path,
                    mode,
                    buffer: ReadBuffer::default(),
                }))
            }
        }
    }

    pub fn role(&self) -> NodeRole {
        match self {
            ClusterFile::Master(_) => NodeRole::Master,
            ClusterFile::Slave(_) => NodeRole::Slave,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ClusterFile::Master(f) => &f.path,
            ClusterFile::Slave(f) => &f.path,
        }
    }

    pub fn mode(&self) -> AccessMode {
        match self {
            ClusterFile::Master(f) => f.mode,
            ClusterFile::Slave(f) => f.mode,
        }
    }

    fn pipe(&self) -> &Pipe<M> {
        match self {
            ClusterFile::Master(f) => &f.pipe,
            ClusterFile::Slave(f) => &f.pipe,
        }
    }

    /// Size of the read buffer, which is always one packet.
    pub fn buffer_size(&self) -> usize {
        self.pipe().packet_capacity()
    }

    /// Buffer size requests are ignored: reads must map onto whole packets.
    /// Returns the size actually in effect.
    pub fn set_buffer_size(&mut self, requested: usize) -> usize {
        let size = self.buffer_size();
        if requested != size {
            debug!(requested, size, "cluster file buffer size is fixed to the packet capacity");
        }
        size
    }

    fn check(&self, operation: &'static str, allowed: bool) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(ClusterError::AccessDenied {
                operation,
                mode: self.mode(),
            })
        }
    }

    /// Read up to `buf.len()` bytes. Returns 0 at end of file. A single call
    /// never returns more than what is left in the current packet.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check("read", self.mode().can_read())?;
        if buf.is_empty() {
            return Ok(0);
        }
        match self {
            ClusterFile::Master(f) => {
                if f.buffer.needs_refill() {
                    f.refill().await?;
                }
                Ok(f.buffer.consume(buf))
            }
            ClusterFile::Slave(f) => {
                if f.buffer.needs_refill() {
                    // Return the drained packet to the pool before the next
                    // one is allocated.
                    f.buffer.discard();
                    let packet = f.pipe.read_chunk().await?;
                    f.buffer.refill(packet);
                }
                Ok(f.buffer.consume(buf))
            }
        }
    }

    pub async fn read_exact(&mut self, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.read(buf).await?;
            if n == 0 {
                return Err(ClusterError::UnexpectedEof);
            }
            let rest = std::mem::take(&mut buf);
            buf = &mut rest[n..];
        }
        Ok(())
    }

    /// Append everything up to end of file to `out`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut chunk = vec![0; self.buffer_size()];
        let start = out.len();
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out.len() - start);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Write to the master's file at the current read position. Slaves accept
    /// and drop the bytes so the same call site works everywhere.
    ///
    /// Bytes read ahead into the buffer are dropped on every node first, and
    /// the master moves its file back to where the caller stopped reading.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.check("write", self.mode().can_write())?;
        match self {
            ClusterFile::Master(f) => {
                let unread = f.buffer.remaining().len();
                f.buffer.discard();
                if unread > 0 {
                    // Bounded by the packet capacity, so it fits an i64.
                    let back = -(unread as i64);
                    if let Err(e) = f.file.seek(SeekFrom::Current(back)).await {
                        return Err(f.fail("seek", e));
                    }
                }
                f.file.write_all(data).await?;
                Ok(data.len())
            }
            ClusterFile::Slave(f) => {
                f.buffer.discard();
                Ok(data.len())
            }
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        if let ClusterFile::Master(f) = self {
            f.file.flush().await?;
        }
        Ok(())
    }

    /// The file's size. The master queries the real file and broadcasts the
    /// answer; slaves receive it.
    pub async fn get_size(&mut self) -> Result<u64> {
        match self {
            ClusterFile::Master(f) => {
                let size = match f.file.metadata().await {
                    Ok(metadata) => metadata.len(),
                    Err(e) => return Err(f.fail("size query", e)),
                };
                if let Err(e) = f.pipe.write(size).and_then(|()| f.pipe.finish_message()) {
                    return Err(f.fail("size query", e));
                }
                Ok(size)
            }
            ClusterFile::Slave(f) => f.pipe.read().await,
        }
    }

    /// Move the read position to `pos` bytes from the start. Buffered data is
    /// dropped on every node.
    pub async fn seek(&mut self, pos: u64) -> Result<()> {
        match self {
            ClusterFile::Master(f) => {
                if let Err(e) = f.file.seek(SeekFrom::Start(pos)).await {
                    return Err(f.fail("seek", e));
                }
                f.buffer.discard();
            }
            ClusterFile::Slave(f) => f.buffer.discard(),
        }
        Ok(())
    }

    /// The master's underlying file. Slaves have none.
    pub fn file(&self) -> Result<&File> {
        match self {
            ClusterFile::Master(f) => Ok(&f.file),
            ClusterFile::Slave(_) => Err(ClusterError::RoleViolation {
                operation: "file",
                role: NodeRole::Slave,
            }),
        }
    }

    #[cfg(unix)]
    pub fn raw_fd(&self) -> Result<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd;
        self.file().map(|file| file.as_raw_fd())
    }

    pub async fn close(mut self) -> Result<()> {
        if self.mode().can_write() {
            self.flush().await?;
        }
        match self {
            ClusterFile::Master(f) => f.pipe.close(),
            ClusterFile::Slave(f) => f.pipe.close(),
        }
    }
}

impl<M: Multiplexer> MasterFile<M> {
    /// Read the next packet's worth from disk and forward it. The read-ahead
    /// buffer is reused, so only the chunk in flight borrows from the pool.
    async fn refill(&mut self) -> Result<()> {
        let mut bytes = self.buffer.take().unwrap_or_default();
        bytes.resize(self.pipe.packet_capacity(), 0);
        let filled = match fill(&mut self.file, &mut bytes).await {
            Ok(filled) => filled,
            Err(e) => return Err(self.fail("read", e)),
        };
        bytes.truncate(filled);
        if let Err(e) = self.pipe.write_chunk(&bytes) {
            return Err(self.fail("read", e));
        }
        self.buffer.refill(bytes);
        Ok(())
    }

    /// Report a failure to the slaves before handing it to the caller, so
    /// they do not wait for data that will never come.
    fn fail(&mut self, operation: &str, error: impl Into<ClusterError>) -> ClusterError {
        let error = error.into();
        let reason = format!("{operation} of {} failed: {error}", self.path.display());
        warn!(%reason, "cluster file failed on master");
        if let Err(e) = self.pipe.abort(&reason) {
            warn!(error = %e, "could not signal file failure to slaves");
        }
        error
    }
}

/// Read until `buf` is full or the file ends.
async fn fill(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn open_options(mode: AccessMode) -> OpenOptions {
    let mut options = OpenOptions::new();
    match mode {
        AccessMode::ReadOnly => options.read(true),
        AccessMode::WriteOnly => options.write(true).create(true).truncate(true),
        AccessMode::ReadWrite => options.read(true).write(true).create(true),
    };
    options
}
