use bytes::BytesMut;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Pre-allocated pool of packet payload buffers, shared by senders and the router's
///  receive path. The pool is strictly bounded: all buffers are allocated up front,
///  and acquisition fails once they are all in flight. Exhaustion is an observable
///  condition that callers handle (skip an iteration, drop a datagram), not a cue
///  to allocate more.
pub struct BufferPool {
    buf_size: usize,
    count: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, count: usize) -> BufferPool {
        let buffers = (0..count)
            .map(|_| BytesMut::with_capacity(buf_size))
            .collect();

        BufferPool {
            buf_size,
            count,
            buffers: Mutex::new(buffers),
        }
    }

    /// per-buffer capacity in bytes
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// total number of buffers owned by the pool
    pub fn capacity(&self) -> usize {
        self.count
    }

    /// number of buffers currently free
    pub fn available(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    pub fn try_get(&self) -> Option<BytesMut> {
        let mut buffers = self.buffers.lock().unwrap();
        match buffers.pop() {
            Some(buffer) => {
                trace!("taking buffer from pool ({} left)", buffers.len());
                Some(buffer)
            }
            None => {
                debug!("buffer pool exhausted");
                None
            }
        }
    }

    pub fn return_buf(&self, mut buffer: BytesMut) {
        assert_eq!(buffer.capacity(), self.buf_size,
                   "returned buffer does not have the regular capacity of {} bytes, maybe a payload exceeding the configured buffer size was written"
                   , self.buf_size);

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.count {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is already full: discarding returned buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use super::*;

    #[test]
    fn test_bounded_acquisition() {
        let pool = BufferPool::new(300, 2);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.available(), 2);

        let a = pool.try_get().unwrap();
        let b = pool.try_get().unwrap();
        assert_eq!(pool.available(), 0);

        assert!(pool.try_get().is_none());

        pool.return_buf(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_get().is_some());

        pool.return_buf(b);
    }

    #[test]
    fn test_clear_on_return() {
        let pool = BufferPool::new(10, 1);

        let mut buf = pool.try_get().unwrap();
        buf.put_u8(1);

        pool.return_buf(buf);

        assert!(pool.try_get().unwrap().is_empty());
    }

    #[test]
    fn test_buffers_allocated_up_front() {
        let pool = BufferPool::new(300, 10);
        assert_eq!(pool.available(), 10);

        let bufs: Vec<_> = (0..10).map(|_| pool.try_get().unwrap()).collect();
        assert_eq!(pool.available(), 0);
        assert!(bufs.iter().all(|b| b.capacity() == 300));

        for buf in bufs {
            pool.return_buf(buf);
        }
        assert_eq!(pool.available(), 10);
    }

    #[test]
    #[should_panic]
    fn test_foreign_buffer_rejected() {
        let pool = BufferPool::new(300, 1);
        pool.return_buf(BytesMut::with_capacity(17));
    }
}
