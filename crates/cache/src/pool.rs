//! Bounded free-list of tile buffers
//!
//! Tiles handed out by the tile cache are pulled from a [`BufferPool`].
//! When the last reference to a tile goes away its buffer is offered back
//! through [`BufferPool::release`], which keeps it if the pool has room and
//! frees it otherwise. Steady-state tile churn therefore does not allocate,
//! and the memory held by the pool is bounded by `capacity * TILE_SIZE^2`.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::tile_cache::TILE_SIZE;

/// Outcome of offering a buffer back to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Buffer was pushed onto the free stack
    Recycled,
    /// Pool was full; buffer was dropped
    Freed,
}

#[derive(Debug)]
struct PoolState {
    stack: Vec<Vec<f32>>,
    capacity: usize,
}

/// Pool of reusable `TILE_SIZE * TILE_SIZE` float buffers
#[derive(Debug)]
pub struct BufferPool {
    state: Mutex<PoolState>,
    allocations: AtomicU64,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                stack: Vec::with_capacity(capacity),
                capacity,
            }),
            allocations: AtomicU64::new(0),
        })
    }

    /// Change the capacity by `delta` slots (never below zero)
    pub fn grow(&self, delta: isize) {
        let mut state = self.state.lock();
        state.capacity = state.capacity.saturating_add_signed(delta);
        let capacity = state.capacity;
        state.stack.truncate(capacity);
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Take a buffer sized `width * height`, NaN-filled
    ///
    /// Reuses a free buffer when one is available and allocates otherwise.
    pub fn pull(self: &Arc<Self>, width: usize, height: usize) -> PooledBuffer {
        let reused = self.state.lock().stack.pop();
        let mut data = match reused {
            Some(data) => data,
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(TILE_SIZE * TILE_SIZE)
            }
        };
        data.clear();
        data.resize(width * height, f32::NAN);

        PooledBuffer {
            data,
            width,
            height,
            pool: Arc::downgrade(self),
        }
    }

    /// True when the free stack has reached capacity
    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        state.stack.len() >= state.capacity
    }

    /// Offer a buffer back to the pool
    pub fn release(&self, buffer: Vec<f32>) -> Release {
        let mut state = self.state.lock();
        if state.stack.len() < state.capacity {
            state.stack.push(buffer);
            Release::Recycled
        } else {
            Release::Freed
        }
    }

    /// Buffers currently on the free stack
    pub fn available(&self) -> usize {
        self.state.lock().stack.len()
    }

    /// Number of buffers allocated by this pool so far
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }
}

/// A buffer on loan from a [`BufferPool`]
///
/// Returned to the pool on drop if the pool still exists.
pub struct PooledBuffer {
    data: Vec<f32>,
    width: usize,
    height: usize,
    pool: Weak<BufferPool>,
}

impl PooledBuffer {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// One row of the buffer
    pub fn row(&self, y: usize) -> &[f32] {
        &self.data[y * self.width..(y + 1) * self.width]
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl Deref for PooledBuffer {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

/// A tile shared between the tile cache and its readers
pub type Tile = Arc<PooledBuffer>;
