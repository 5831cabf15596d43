use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

use parking_lot::Mutex;

/// Size of every relay buffer
pub const BUFFER_SIZE: usize = 16 * 1024;

/// Idle buffers kept around at most
const MAX_IDLE: usize = 256;

/// Pool of fixed-size relay buffers
#[derive(Debug, Default)]
pub struct BufferPool {
    idle: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide pool used by the relays
    pub fn global() -> &'static BufferPool {
        static POOL: OnceLock<BufferPool> = OnceLock::new();
        POOL.get_or_init(BufferPool::new)
    }

    pub fn get(&self) -> PooledBuf<'_> {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE].into_boxed_slice());
        PooledBuf {
            buf: Some(buf),
            pool: self,
        }
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn put(&self, buf: Box<[u8]>) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(buf);
        }
    }
}

/// A buffer checked out of a [`BufferPool`], returned on drop
pub struct PooledBuf<'a> {
    buf: Option<Box<[u8]>>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}
