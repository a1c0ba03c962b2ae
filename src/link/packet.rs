use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::bail;
use bytes::BytesMut;
use tracing::debug;

use crate::link::buffer_pool::BufferPool;

/// A payload buffer in flight, coupled to the pool it came from.
///
/// Ownership is the buffer lifecycle: a packet is acquired from the pool, handed to
///  the link by value on send (the link releases the buffer after transmission), and
///  returned to the pool by `Drop` on every other path. A packet is therefore
///  released exactly once, and never both sent and released.
pub struct Packet {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Packet {
    /// Acquire a pooled buffer for a payload of up to `size` bytes. Returns `None`
    ///  when the pool is exhausted or the request exceeds the per-buffer capacity.
    pub fn acquire(pool: &Arc<BufferPool>, size: usize) -> Option<Packet> {
        if size > pool.buf_size() {
            debug!("requested payload size {} exceeds pool buffer size {}", size, pool.buf_size());
            return None;
        }

        let buf = pool.try_get()?;
        Some(Packet {
            buf,
            pool: pool.clone(),
        })
    }

    /// Wrap a buffer that already holds received payload bytes. The buffer must
    ///  come from `pool`.
    pub(crate) fn from_buf(pool: &Arc<BufferPool>, buf: BytesMut) -> Packet {
        Packet {
            buf,
            pool: pool.clone(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Replace the payload. The length of the packet becomes `data.len()`.
    pub fn set_payload(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if data.len() > self.pool.buf_size() {
            bail!("payload of {} bytes exceeds the buffer capacity of {}", data.len(), self.pool.buf_size());
        }

        self.buf.clear();
        self.buf.extend_from_slice(data);
        Ok(())
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet[{} bytes]", self.buf.len())
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        // return_buf asserts the regular capacity, and drop must not panic
        if buf.capacity() == self.pool.buf_size() {
            self.pool.return_buf(buf);
        }
    }
}
