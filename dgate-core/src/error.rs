//! Error types for the ingestion pipeline.
//!
//! Every failure in the pipeline is fatal: nothing is retried, the error
//! unwinds to the reader's caller and the scoped owners (region, semaphores,
//! subprocess) release their resources on the way out.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DgateError>;

/// Errors raised by the shared-memory ingestion pipeline.
#[derive(Error, Debug)]
pub enum DgateError {
    /// A control cell carried a tag other than the one the current builder
    /// phase requires.
    #[error("expected {expected} cell, received tag {actual}")]
    UnexpectedCell {
        /// The cell kind the reader was waiting for.
        expected: &'static str,
        /// The raw tag found in the ring.
        actual: u32,
    },

    /// A control cell carried a tag outside the protocol's value set.
    #[error("unknown cell tag {0}")]
    UnknownCellKind(u32),

    /// A cell addressed a table other than the one currently being built.
    #[error("cell addressed table {actual} while building table {expected}")]
    TableIdMismatch {
        /// Id of the table the builder owns.
        expected: u32,
        /// Id carried by the offending cell.
        actual: u32,
    },

    /// A schema or generation-info payload used a type code outside the
    /// protocol's value set.
    #[error("unknown column type code {0}")]
    UnknownColumnType(u32),

    /// Generation info named a column that is not part of the table schema.
    #[error("generated column {name:?} does not belong to table {table:?}")]
    UnknownGeneratedColumn {
        /// Name of the table being built.
        table: String,
        /// The column name that could not be resolved.
        name: String,
    },

    /// A payload read ran past the end of a data slot.
    #[error("payload field {index} exceeds data cell capacity of {capacity} fields")]
    PayloadOutOfBounds {
        /// Flat field index that was requested.
        index: u32,
        /// Number of field slots in a data cell.
        capacity: u32,
    },

    /// A data cell placed a row outside the table's declared bounds.
    #[error("row {row} is outside the table of {num_rows} rows")]
    RowOutOfRange {
        /// Absolute row position computed from the sorting id.
        row: i64,
        /// Declared table row count.
        num_rows: i64,
    },

    /// A builder entry point was invoked in the wrong lifecycle state.
    #[error("table builder received {operation} while {state}")]
    BuilderState {
        /// The operation that was attempted.
        operation: &'static str,
        /// Human-readable description of the current state.
        state: &'static str,
    },

    /// TABLE_COMPLETED arrived before every expected row did.
    #[error("table {table:?} completed after {received} of {expected} rows")]
    IncompleteTable {
        /// Name of the table being built.
        table: String,
        /// Rows received so far.
        received: i64,
        /// Rows the schema declared.
        expected: i64,
    },

    /// `add` was called on a column the producer never generates.
    #[error("cannot add data to a non-generated column")]
    PlaceholderAdd,

    /// Column accumulators disagreed on the number of segments at
    /// `build_table` time.
    #[error("column {column} ran out of segments while others still have data")]
    SegmentCountMismatch {
        /// Schema index of the exhausted column.
        column: usize,
    },

    /// A control cell referenced a data-slot offset outside the pool or not
    /// aligned to a slot boundary.
    #[error("cell referenced invalid data slot offset {offset}")]
    BadSlotOffset {
        /// The offending byte offset, relative to the data pool base.
        offset: u32,
    },

    /// A chunk's segments disagreed on their row count.
    #[error("column {column} produced a segment of {actual} rows where {expected} were expected")]
    ChunkRowMismatch {
        /// Schema index of the misaligned column.
        column: usize,
        /// Row count of the chunk's first segment.
        expected: usize,
        /// Row count the offending column produced.
        actual: usize,
    },

    /// The ring writer caught up with the ring reader; writing would
    /// overwrite a cell that has not been consumed yet.
    #[error("ring write index {write} reached read index {read}; cell not yet retrieved")]
    RingOverrun {
        /// Current write index.
        write: u64,
        /// Current read index.
        read: u64,
    },

    /// The requested shared-memory geometry is unusable.
    #[error("invalid shared-memory layout: {0}")]
    InvalidLayout(String),

    /// An operation on a named OS resource failed.
    #[error("{op} failed")]
    Resource {
        /// The syscall or resource operation that failed.
        op: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The generator subprocess exited before the stream was drained.
    #[error("generator exited early with code {code:?}")]
    ProducerExit {
        /// Exit code if the child terminated normally.
        code: Option<i32>,
    },
}

impl DgateError {
    /// Wraps the current `errno` into a [`DgateError::Resource`].
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        DgateError::Resource {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}
