//! Pooled byte buffers backing frame building and response parsing.
//!
//! Request headers, extras, and response payloads all borrow from one
//! cluster-wide pool instead of allocating per message. Buffers are
//! size-classed by power of two; a [`PooledBuf`] is a move-only handle
//! whose `Drop` always returns the storage to the pool, so there is no
//! release call to forget on an error path.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Smallest size class handed out, in bytes.
const MIN_CLASS: usize = 64;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Largest single buffer the pool will hand out. Acquiring more is an
    /// `InvalidArgument` error.
    pub max_buffer_size: usize,

    /// Maximum free buffers retained per size class; everything beyond
    /// this is dropped on release.
    pub max_free_per_class: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 1024 * 1024, // 1MB, the usual item ceiling
            max_free_per_class: 64,
        }
    }
}

struct PoolInner {
    /// One free list per power-of-two size class, smallest first.
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    config: BufferPoolConfig,
    /// Buffers currently on loan. Used by tests and debug assertions to
    /// detect leaks.
    outstanding: AtomicUsize,
}

/// Size-classed pool of byte buffers, safe for concurrent use from every
/// node's loops.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        let mut classes = Vec::new();
        let mut size = MIN_CLASS;
        while size < config.max_buffer_size {
            classes.push(Mutex::new(Vec::new()));
            size *= 2;
        }
        classes.push(Mutex::new(Vec::new()));

        Self {
            inner: Arc::new(PoolInner {
                classes,
                config,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Acquire a zeroed buffer of at least `len` bytes.
    pub fn acquire(&self, len: usize) -> Result<PooledBuf> {
        if len > self.inner.config.max_buffer_size {
            return Err(Error::InvalidArgument(format!(
                "buffer request of {} bytes exceeds pool maximum of {}",
                len, self.inner.config.max_buffer_size
            )));
        }

        let class = Self::class_index(len);
        let class_size = MIN_CLASS << class;

        let mut storage = {
            let mut free = self.inner.classes[class].lock();
            free.pop()
        }
        .unwrap_or_else(|| vec![0u8; class_size]);

        // Recycled buffers come back dirty.
        storage.iter_mut().for_each(|b| *b = 0);
        storage.resize(class_size, 0);

        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);

        Ok(PooledBuf {
            storage: Some(storage),
            len,
            class,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Number of buffers currently on loan.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Relaxed)
    }

    fn class_index(len: usize) -> usize {
        let mut class = 0;
        let mut size = MIN_CLASS;
        while size < len {
            size *= 2;
            class += 1;
        }
        class
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("classes", &self.inner.classes.len())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// A byte buffer on loan from a [`BufferPool`].
///
/// Ownership is exclusive to whoever holds the value; dropping it returns
/// the storage to the pool (or frees it if the pool is gone).
pub struct PooledBuf {
    storage: Option<Vec<u8>>,
    len: usize,
    class: usize,
    pool: std::sync::Weak<PoolInner>,
}

impl PooledBuf {
    /// Logical length; the underlying storage may be larger.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrink the logical length. Growing is not supported; acquire a
    /// larger buffer instead.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage.as_ref().expect("buffer present until drop")[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.storage.as_mut().expect("buffer present until drop")[..len]
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.len)
            .field("class", &self.class)
            .finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let storage = self.storage.take().expect("double drop");
        if let Some(pool) = self.pool.upgrade() {
            pool.outstanding.fetch_sub(1, Ordering::Relaxed);
            let mut free = pool.classes[self.class].lock();
            if free.len() < pool.config.max_free_per_class {
                free.push(storage);
            }
        }
    }
}
