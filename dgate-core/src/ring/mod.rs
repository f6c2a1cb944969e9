//! Bounded cross-process queue of control cells.
//!
//! Backpressure runs through two named counting semaphores: `data-ready`
//! counts cells the producer has published, `buffer-free` counts data slots
//! the consumer has handed back. The cell array itself lives in the shared
//! memory region; each process keeps its own indices.

mod buffer;
mod semaphore;

pub use buffer::{MultiProcessRingBuffer, RetrievalGuard, WritingGuard};
pub use semaphore::NamedSemaphore;
