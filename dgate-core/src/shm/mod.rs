//! Shared-memory protocol: region layout and ownership.
//!
//! The region is a single named POSIX shared-memory object with a fixed
//! binary layout: a ring of control cells at offset 0, a gap, and a pool of
//! data slots starting at a well-known offset. Both sides of the protocol
//! are built against the same geometry constants.

mod layout;
mod region;

pub use layout::{
    decode_string_field, write_string_field, CellKind, DataCellView, RingBufferCell, ShmLayout,
};
pub use region::SharedMemoryRegion;

/// Default name of the shared-memory object, reused verbatim by the
/// generator.
pub const SHARED_MEMORY_NAME: &str = "/PDGF_SHARED_MEMORY";

/// Default name of the semaphore counting cells ready for retrieval.
pub const DATA_READY_SEM: &str = "/PDGF_DATA_READY_SEM";

/// Default name of the semaphore counting free data slots.
pub const BUFFER_FREE_SEM: &str = "/PDGF_BUFFER_FREE_SEM";

/// Rows per work unit (W), as configured in the generator build.
pub const DEFAULT_WORK_UNIT_SIZE: u32 = 128;

/// Maximum generated columns per data cell (K).
pub const DEFAULT_COLUMN_COUNT: u32 = 16;

/// Byte width of one field slot (F); wide enough for the longest generated
/// string value.
pub const DEFAULT_FIELD_SIZE: u32 = 3 * 64;

/// Total field slots in the data pool (2²³).
pub const DEFAULT_FIELD_SLOT_BUDGET: u32 = 1 << 23;

/// Byte offset of the data pool inside the region (2²⁸), leaving headroom
/// for the control-cell ring.
pub const DEFAULT_DATA_POOL_OFFSET: usize = 1 << 28;
