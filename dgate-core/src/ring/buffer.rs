//! Cross-process bounded ring of control cells.
//!
//! One `MultiProcessRingBuffer` instance lives in each process, over the
//! same cell array. The instances never share their indices; the only
//! cross-process state is the cell array itself and the two counting
//! semaphores. Each instance consumes one semaphore before reading a cell
//! and posts the other after writing one, so the reader's publish side is
//! the producer's consume side and vice versa.
//!
//! Within a process, each side is additionally guarded by a mutex so the
//! coordinator stays safe if callers ever add worker threads; no suspension
//! happens while a mutex is held except the caller's own cell handling.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{DgateError, Result};
use crate::ring::semaphore::NamedSemaphore;
use crate::shm::{RingBufferCell, SharedMemoryRegion};

/// Coordinator for one side of the control-cell ring.
#[derive(Debug)]
pub struct MultiProcessRingBuffer {
    cells: *mut RingBufferCell,
    capacity: u32,

    /// Cells consumed by this instance so far; private to this process.
    read_index: AtomicU64,

    /// Cells published by this instance so far; private to this process.
    write_index: AtomicU64,

    read_access: Mutex<()>,
    write_access: Mutex<()>,

    /// Counts cells available for retrieval by this instance.
    consume_sem: NamedSemaphore,

    /// Counts cells this instance has handed to the other side.
    publish_sem: NamedSemaphore,
}

// Safety: the cell array is only touched while holding the respective side's
// mutex and a semaphore credit; the raw pointer itself is position-only.
unsafe impl Send for MultiProcessRingBuffer {}
unsafe impl Sync for MultiProcessRingBuffer {}

impl MultiProcessRingBuffer {
    /// Creates the reader-side coordinator: creates both semaphores
    /// (`data-ready` at 0, `buffer-free` at ring capacity) and pre-fills
    /// every cell as a NOOP handing its data slot to the producer.
    pub fn create_for_reader(
        region: &SharedMemoryRegion,
        data_ready_name: &str,
        buffer_free_name: &str,
    ) -> Result<Self> {
        let capacity = region.layout().ring_capacity();
        let consume_sem = NamedSemaphore::create(data_ready_name, 0)?;
        let publish_sem = NamedSemaphore::create(buffer_free_name, capacity)?;

        let ring = Self::over(region, consume_sem, publish_sem);

        // All data slots start out owned by the producer: each cell is a
        // NOOP carrying its slot's offset, and `buffer-free` credits the
        // producer with the full ring.
        let slot_bytes = region.layout().data_slot_bytes() as u32;
        for i in 0..capacity {
            let cell = unsafe { &mut *ring.cells.add(i as usize) };
            *cell = bytemuck::Zeroable::zeroed();
            cell.write_noop(i * slot_bytes);
        }

        Ok(ring)
    }

    /// Attaches the producer-side mirror: consumes `buffer-free`, publishes
    /// `data-ready`. Used by in-process mock producers; the real generator
    /// attaches from its own runtime.
    pub fn attach_for_producer(
        region: &SharedMemoryRegion,
        data_ready_name: &str,
        buffer_free_name: &str,
    ) -> Result<Self> {
        let consume_sem = NamedSemaphore::open(buffer_free_name)?;
        let publish_sem = NamedSemaphore::open(data_ready_name)?;
        Ok(Self::over(region, consume_sem, publish_sem))
    }

    fn over(
        region: &SharedMemoryRegion,
        consume_sem: NamedSemaphore,
        publish_sem: NamedSemaphore,
    ) -> Self {
        Self {
            cells: region.cells_ptr(),
            capacity: region.layout().ring_capacity(),
            read_index: AtomicU64::new(0),
            write_index: AtomicU64::new(0),
            read_access: Mutex::new(()),
            write_access: Mutex::new(()),
            consume_sem,
            publish_sem,
        }
    }

    /// Blocks until the other side has published a cell, then locks the
    /// read side and hands out the cell at the read index.
    ///
    /// The caller must finish reading the cell and its data slot before
    /// calling [`RetrievalGuard::finish`]; dropping the guard without
    /// finishing leaves the read index in place (the abort path).
    pub fn prepare_retrieval(&self) -> Result<RetrievalGuard<'_>> {
        self.consume_sem.wait()?;
        let lock = self.read_access.lock();
        Ok(RetrievalGuard { ring: self, _lock: lock })
    }

    /// Locks the write side and hands out the cell at the write index.
    ///
    /// A cell position must have been retrieved before it can be rewritten;
    /// attempting to overtake the read index is fatal, never silent
    /// corruption.
    pub fn prepare_writing(&self) -> Result<WritingGuard<'_>> {
        let lock = self.write_access.lock();
        let write = self.write_index.load(Ordering::Relaxed);
        let read = self.read_index.load(Ordering::Relaxed);
        if write >= read {
            return Err(DgateError::RingOverrun { write, read });
        }
        Ok(WritingGuard { ring: self, _lock: lock })
    }

    /// Number of cells in the ring (R).
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Cells consumed by this instance so far.
    pub fn cells_read(&self) -> u64 {
        self.read_index.load(Ordering::Relaxed)
    }

    /// Cells published by this instance so far.
    pub fn cells_written(&self) -> u64 {
        self.write_index.load(Ordering::Relaxed)
    }

    fn cell_at(&self, index: u64) -> *mut RingBufferCell {
        unsafe { self.cells.add((index % self.capacity as u64) as usize) }
    }
}

/// Exclusive access to the cell at the read index.
pub struct RetrievalGuard<'a> {
    ring: &'a MultiProcessRingBuffer,
    _lock: MutexGuard<'a, ()>,
}

impl RetrievalGuard<'_> {
    /// The cell being retrieved.
    pub fn cell(&self) -> &RingBufferCell {
        // Safety: the semaphore credit transferred this cell to us and the
        // read mutex serializes readers in this process.
        unsafe { &*self.ring.cell_at(self.ring.read_index.load(Ordering::Relaxed)) }
    }

    /// Advances the read index past this cell and releases the read side.
    pub fn finish(self) {
        self.ring.read_index.fetch_add(1, Ordering::Relaxed);
    }
}

/// Exclusive access to the cell at the write index.
#[derive(Debug)]
pub struct WritingGuard<'a> {
    ring: &'a MultiProcessRingBuffer,
    _lock: MutexGuard<'a, ()>,
}

impl WritingGuard<'_> {
    /// The cell being written.
    pub fn cell_mut(&mut self) -> &mut RingBufferCell {
        // Safety: `prepare_writing` verified this position was already
        // retrieved, and the write mutex serializes writers in this process.
        unsafe { &mut *self.ring.cell_at(self.ring.write_index.load(Ordering::Relaxed)) }
    }

    /// Advances the write index, releases the write side, and hands the
    /// cell to the other side.
    pub fn finish(self) -> Result<()> {
        let WritingGuard { ring, _lock } = self;
        ring.write_index.fetch_add(1, Ordering::Relaxed);
        drop(_lock);
        ring.publish_sem.post()
    }
}
