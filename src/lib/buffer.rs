use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Copy window used for response relays and websocket pumps.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

const MAX_IDLE_BUFFERS: usize = 64;

/// A process-wide pool of fixed-size copy buffers.
///
/// Buffers are acquired per request or per pump and always return to the
/// pool when the [PooledBuf] guard drops, whichever way the holder exits.
#[derive(Debug, Clone)]
pub struct BufferPool {
  inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
  idle: Mutex<Vec<Vec<u8>>>,
  buf_size: usize,
}

impl BufferPool {
  pub fn new() -> Self {
    Self::with_buf_size(COPY_BUFFER_SIZE)
  }

  pub fn with_buf_size(buf_size: usize) -> Self {
    Self {
      inner: Arc::new(Inner {
        idle: Mutex::new(Vec::new()),
        buf_size,
      }),
    }
  }

  pub fn buf_size(&self) -> usize {
    self.inner.buf_size
  }

  pub fn get(&self) -> PooledBuf {
    let buf = match self.inner.idle.lock().pop() {
      Some(buf) => buf,
      None => vec![0u8; self.inner.buf_size],
    };

    PooledBuf {
      buf: Some(buf),
      pool: self.clone(),
    }
  }

  fn put(&self, buf: Vec<u8>) {
    let mut idle = self.inner.idle.lock();
    if idle.len() < MAX_IDLE_BUFFERS {
      idle.push(buf);
    }
  }
}

impl Default for BufferPool {
  fn default() -> Self {
    Self::new()
  }
}

/// A buffer checked out of a [BufferPool], returned on drop.
#[derive(Debug)]
pub struct PooledBuf {
  buf: Option<Vec<u8>>,
  pool: BufferPool,
}

impl Deref for PooledBuf {
  type Target = [u8];
  fn deref(&self) -> &Self::Target {
    // unwrap: buf is only taken in drop
    self.buf.as_deref().unwrap()
  }
}

impl DerefMut for PooledBuf {
  fn deref_mut(&mut self) -> &mut Self::Target {
    self.buf.as_deref_mut().unwrap()
  }
}

impl Drop for PooledBuf {
  fn drop(&mut self) {
    if let Some(buf) = self.buf.take() {
      self.pool.put(buf);
    }
  }
}
