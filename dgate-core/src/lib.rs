//! Dgate Core - shared-memory ingestion bridge for external data generators
//!
//! This library receives columnar benchmark data from an out-of-process
//! parallel generator: the generator writes work units into a shared-memory
//! region and enqueues control cells over a semaphore-backed ring; the
//! reader drains the ring, assembles chunked column segments, and yields
//! finished tables to the downstream store.

/// Error types and the crate-wide result alias
pub mod error;

/// Generator subprocess supervision
pub mod process;

/// The consumer driving the ingestion of one generator run
pub mod reader;

/// Cross-process ring of control cells with semaphore backpressure
pub mod ring;

/// Shared-memory region, wire layout and geometry
pub mod shm;

/// Table assembly: accumulators, builders and the chunked output model
pub mod table;

pub use error::{DgateError, Result};
pub use process::{PdgfOptions, PdgfProcess};
pub use reader::SharedMemoryReader;
pub use shm::ShmLayout;
pub use table::{Chunk, ColumnType, Segment, Table, TableBuilder};
