//! Fixed-capacity packets and the pool they are loaned from.

use crate::types::{ClusterError, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Buffers kept around for reuse once their packets are released.
const MAX_FREE_BUFFERS: usize = 64;

/// A pool of equally sized packet buffers.
///
/// Every packet loaned from the pool has the same capacity for the lifetime
/// of the pool, which is what lets master and slaves agree on framing without
/// ever exchanging it. A `limit` caps the number of packets that may be
/// outstanding at once; hitting it is reported as [`ClusterError::PoolExhausted`].
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    capacity: usize,
    limit: Option<usize>,
    outstanding: AtomicUsize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl PacketPool {
    pub fn new(capacity: usize, limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                limit,
                outstanding: AtomicUsize::new(0),
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of packets currently loaned out.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Loan an empty packet from the pool.
    pub fn allocate(&self) -> Result<Packet> {
        let limit = self.inner.limit.unwrap_or(usize::MAX);
        self.inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(ClusterError::PoolExhausted)?;

        let recycled = self
            .inner
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        let buf = recycled.unwrap_or_else(|| vec![0; self.inner.capacity].into_boxed_slice());

        Ok(Packet {
            buf,
            len: 0,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Hand a packet back to the pool. Equivalent to dropping it.
    pub fn release(&self, packet: Packet) {
        drop(packet);
    }
}

impl PoolInner {
    fn recycle(&self, buf: Box<[u8]>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < MAX_FREE_BUFFERS {
            free.push(buf);
        }
    }
}

/// A packet buffer with a single owner.
///
/// Only the first `len()` bytes are meaningful; the rest of the buffer is
/// stale and never leaves the packet through [`Packet::as_slice`].
pub struct Packet {
    buf: Box<[u8]>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl Packet {
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// The occupied head of the packet.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The whole buffer, for filling in place before calling [`Packet::set_len`].
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.buf.len() {
            return Err(ClusterError::PacketOverflow {
                len,
                capacity: self.buf.len(),
            });
        }
        self.len = len;
        Ok(())
    }

    /// Replace the packet contents with `data`.
    pub fn copy_from(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.buf.len() {
            return Err(ClusterError::PacketOverflow {
                len: data.len(),
                capacity: self.buf.len(),
            });
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("capacity", &self.buf.len())
            .finish()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.pool.recycle(std::mem::take(&mut self.buf));
    }
}
