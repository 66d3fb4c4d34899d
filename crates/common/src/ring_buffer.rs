//! Bounded block ring buffer shared by the transfer thread and the consumer
//!
//! The buffer holds `capacity` fixed-size blocks. One producer fills blocks
//! and commits them, one consumer reads committed blocks and releases them.
//! A single mutex guards both indices, and two condition variables
//! (not-empty, not-full) park the consumer and the producer respectively.
//!
//! ```text
//!            read_index            write_index
//!                │                      │
//!   ┌────┬────┬──▼─┬────┬────┬────┬────▼┬────┐
//!   │free│free│ r0 │ r1 │ r2 │ r3 │ w0  │free│
//!   └────┴────┴────┴────┴────┴────┴─────┴────┘
//!                 committed, unread    next write
//! ```
//!
//! One slot is always left unused so that `read_index == write_index` means
//! empty and `write_index + 1 == read_index` means full. Usable capacity is
//! therefore `capacity - 1`.
//!
//! Producer and consumer never own the buffer; they hold a [`Block`] handle to
//! the slot they are working on. The pipeline pre-stages several transfers
//! ahead of the write cursor with [`RingBuffer::peek_write_slot`].

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, trace};

/// Default number of slots
pub const DEFAULT_CAPACITY: usize = 64;

/// Ring buffer construction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("Invalid ring buffer capacity {0} (need at least 2 slots)")]
    InvalidCapacity(usize),
}

/// Handle to one slot's storage
///
/// Cloning the handle does not copy the data. The slot is locked only while a
/// [`BlockGuard`] is alive; under the single-producer/single-consumer
/// discipline the lock is never contended.
pub struct Block<T> {
    storage: Arc<Mutex<Box<[T]>>>,
}

/// Exclusive access to a block's elements
pub type BlockGuard<'a, T> = MutexGuard<'a, Box<[T]>>;

impl<T> Block<T> {
    fn new(storage: Box<[T]>) -> Self {
        Self {
            storage: Arc::new(Mutex::new(storage)),
        }
    }

    /// Lock the block for reading or writing
    pub fn lock(&self) -> BlockGuard<'_, T> {
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of elements in the block
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two handles refer to the same slot storage
    pub fn same_slot(a: &Block<T>, b: &Block<T>) -> bool {
        Arc::ptr_eq(&a.storage, &b.storage)
    }
}

impl<T> Clone for Block<T> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<T> std::fmt::Debug for Block<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("ptr", &Arc::as_ptr(&self.storage))
            .finish()
    }
}

/// Snapshot of the buffer's instrumentation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Blocks committed by the producer
    pub written: u64,
    /// Blocks released by the consumer
    pub read: u64,
    /// Times the consumer blocked on an empty buffer
    pub empty_waits: u64,
    /// Times the producer blocked on a full buffer
    pub full_waits: u64,
}

impl RingStats {
    /// Blocks committed but not yet read
    pub fn fill(&self) -> u64 {
        self.written.saturating_sub(self.read)
    }
}

struct Inner<T> {
    read_index: usize,
    write_index: usize,
    block_size: usize,
    slots: Vec<Block<T>>,
    stats: RingStats,
    writers_waiting: usize,
    shutdown: bool,
}

impl<T> Inner<T> {
    fn used(&self, capacity: usize) -> usize {
        (self.write_index + capacity - self.read_index) % capacity
    }

    fn is_empty(&self) -> bool {
        self.read_index == self.write_index
    }

    fn has_room(&self, capacity: usize, needed: usize) -> bool {
        self.shutdown || capacity - 1 - self.used(capacity) >= needed
    }

    fn slot_at(&self, base: usize, offset: isize) -> Block<T> {
        let capacity = self.slots.len() as isize;
        // Reduce first so that extreme offsets cannot overflow the sum
        let offset = offset.rem_euclid(capacity);
        let index = ((base as isize + offset) % capacity) as usize;
        self.slots[index].clone()
    }
}

/// Bounded circular store of fixed-size blocks
pub struct RingBuffer<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T: Clone + Default> RingBuffer<T> {
    /// Create a buffer with `capacity` slots of zero length
    ///
    /// Call [`RingBuffer::set_block_size`] before handing slots out.
    pub fn new(capacity: usize) -> Result<Self, RingBufferError> {
        if capacity < 2 {
            return Err(RingBufferError::InvalidCapacity(capacity));
        }

        let slots = (0..capacity)
            .map(|_| Block::new(Vec::new().into_boxed_slice()))
            .collect();

        Ok(Self {
            capacity,
            inner: Mutex::new(Inner {
                read_index: 0,
                write_index: 0,
                block_size: 0,
                slots,
                stats: RingStats::default(),
                writers_waiting: 0,
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    /// Create a buffer and allocate its blocks in one go
    pub fn with_block_size(capacity: usize, block_size: usize) -> Result<Self, RingBufferError> {
        let buffer = Self::new(capacity)?;
        buffer.set_block_size(block_size);
        Ok(buffer)
    }

    /// Set the number of elements per block
    ///
    /// Storage is reallocated only when the size changes. Handles obtained
    /// before a resize keep pointing at the old storage, which is no longer
    /// part of the ring.
    pub fn set_block_size(&self, size: usize) {
        let mut inner = self.lock();
        if inner.block_size == size {
            return;
        }

        inner.block_size = size;
        inner.slots = (0..self.capacity)
            .map(|_| Block::new(vec![T::default(); size].into_boxed_slice()))
            .collect();
        debug!(
            "Ring buffer allocated {} blocks of {} elements",
            self.capacity, size
        );
    }
}

impl<T> RingBuffer<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of slots, including the one kept unused
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Elements per block
    pub fn block_size(&self) -> usize {
        self.lock().block_size
    }

    /// Next writable slot, blocking while the buffer is full
    pub fn acquire_write_slot(&self) -> Block<T> {
        self.acquire_write_slot_ahead(0)
    }

    /// Slot `offset` positions after the write cursor, blocking until it is free
    ///
    /// Waits until at least `offset + 1` usable slots are free, so neither the
    /// returned slot nor any slot between it and the write cursor holds
    /// unread data. `offset` must be below `capacity - 1`; larger values are
    /// clamped to the usable capacity.
    pub fn acquire_write_slot_ahead(&self, offset: usize) -> Block<T> {
        let capacity = self.capacity;
        let needed = (offset + 1).min(capacity - 1);

        let mut inner = self.lock();
        if !inner.has_room(capacity, needed) {
            inner.stats.full_waits += 1;
            inner.writers_waiting += 1;
            trace!("Ring buffer full, producer waiting");
            inner = self
                .not_full
                .wait_while(inner, |inner| !inner.has_room(capacity, needed))
                .unwrap_or_else(PoisonError::into_inner);
            inner.writers_waiting -= 1;
        }

        let base = inner.write_index;
        inner.slot_at(base, offset as isize)
    }

    /// Publish the block at the write cursor to the consumer
    pub fn commit_write(&self) {
        let mut inner = self.lock();
        let was_empty = inner.is_empty();
        inner.write_index = (inner.write_index + 1) % self.capacity;
        inner.stats.written += 1;
        if was_empty {
            self.not_empty.notify_all();
        }
    }

    /// Next readable slot, blocking while the buffer is empty
    ///
    /// After [`RingBuffer::shutdown`] this returns immediately with a slot
    /// whose content is meaningless; check [`RingBuffer::is_shutdown`].
    pub fn acquire_read_slot(&self) -> Block<T> {
        let mut inner = self.lock();
        if inner.is_empty() && !inner.shutdown {
            inner.stats.empty_waits += 1;
            trace!("Ring buffer empty, consumer waiting");
            inner = self
                .not_empty
                .wait_while(inner, |inner| inner.is_empty() && !inner.shutdown)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let base = inner.read_index;
        inner.slot_at(base, 0)
    }

    /// Release the block at the read cursor back to the producer
    pub fn commit_read(&self) {
        let mut inner = self.lock();
        let was_full = inner.used(self.capacity) == self.capacity - 1;
        inner.read_index = (inner.read_index + 1) % self.capacity;
        inner.stats.read += 1;
        // A producer reserving several slots ahead parks before the buffer
        // is strictly full, so it must be woken on every release.
        if was_full || inner.writers_waiting > 0 {
            self.not_full.notify_all();
        }
    }

    /// Slot at `write_index + offset`, without blocking or moving indices
    pub fn peek_write_slot(&self, offset: isize) -> Block<T> {
        let inner = self.lock();
        inner.slot_at(inner.write_index, offset)
    }

    /// Slot at `read_index + offset`, without blocking or moving indices
    pub fn peek_read_slot(&self, offset: isize) -> Block<T> {
        let inner = self.lock();
        inner.slot_at(inner.read_index, offset)
    }

    /// Force both sides out of their waits
    ///
    /// Places the read index at 0 and the write index at `capacity / 2` and
    /// wakes every waiter. The buffer content is meaningless afterwards and
    /// it must not be used to exchange real data again.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.read_index = 0;
        inner.write_index = self.capacity / 2;
        inner.shutdown = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
        debug!("Ring buffer shut down");
    }

    /// Whether [`RingBuffer::shutdown`] has been called
    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Blocks committed by the producer
    pub fn write_count(&self) -> u64 {
        self.lock().stats.written
    }

    /// Blocks released by the consumer
    pub fn read_count(&self) -> u64 {
        self.lock().stats.read
    }

    /// Committed blocks not yet read (writes minus reads)
    pub fn fill_count(&self) -> u64 {
        self.lock().stats.fill()
    }

    /// Times the producer blocked on a full buffer
    pub fn full_count(&self) -> u64 {
        self.lock().stats.full_waits
    }

    /// Times the consumer blocked on an empty buffer
    pub fn empty_count(&self) -> u64 {
        self.lock().stats.empty_waits
    }

    /// Usable slots currently free for the producer
    pub fn free_slots(&self) -> usize {
        let inner = self.lock();
        self.capacity - 1 - inner.used(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().used(self.capacity) == self.capacity - 1
    }

    /// Snapshot of all counters taken under one lock
    pub fn stats(&self) -> RingStats {
        self.lock().stats
    }
}
