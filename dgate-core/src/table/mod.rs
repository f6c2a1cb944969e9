//! Assembled tables and their building blocks.
//!
//! The pipeline yields plain, unencoded data: a table is an ordered list of
//! chunks, a chunk holds one segment per schema column, and all segments of
//! a chunk have the same row count. Encoding, indexing and constraints are
//! the downstream engine's business.

mod builder;
mod column;

pub use builder::TableBuilder;
pub use column::{ColumnAccumulator, GeneratedColumn, PlaceholderColumn};

use crate::error::{DgateError, Result};

/// Column type codes of the wire protocol.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Variable-width UTF-8 string, NUL-terminated inside its field slot.
    String = 0,

    /// 32-bit signed integer.
    Integer = 1,

    /// 64-bit signed integer.
    Long = 2,

    /// 64-bit IEEE-754 float.
    Double = 3,

    /// Boolean, carried as a 32-bit integer in {0, 1}.
    Bool = 4,
}

impl TryFrom<u32> for ColumnType {
    type Error = DgateError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(ColumnType::String),
            1 => Ok(ColumnType::Integer),
            2 => Ok(ColumnType::Long),
            3 => Ok(ColumnType::Double),
            4 => Ok(ColumnType::Bool),
            other => Err(DgateError::UnknownColumnType(other)),
        }
    }
}

/// Name and type of one schema column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    /// Column name, lowercased on ingest.
    pub name: String,

    /// Declared wire type.
    pub column_type: ColumnType,
}

/// One column's slice of a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Owned string values.
    String(Vec<String>),

    /// 32-bit integer values; also carries BOOL columns as {0, 1}.
    Integer(Vec<i32>),

    /// 64-bit integer values.
    Long(Vec<i64>),

    /// 64-bit float values.
    Double(Vec<f64>),

    /// Stand-in for a column the producer never generated: no values, only
    /// the logical row count.
    Placeholder {
        /// The column's declared type.
        column_type: ColumnType,
        /// Rows this segment stands in for.
        row_count: u32,
    },
}

impl Segment {
    /// Logical number of rows in the segment.
    pub fn row_count(&self) -> usize {
        match self {
            Segment::String(values) => values.len(),
            Segment::Integer(values) => values.len(),
            Segment::Long(values) => values.len(),
            Segment::Double(values) => values.len(),
            Segment::Placeholder { row_count, .. } => *row_count as usize,
        }
    }
}

/// A horizontal slice of a table: one segment per schema column, all with
/// the same row count.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Segments in schema column order.
    pub segments: Vec<Segment>,
}

impl Chunk {
    /// Rows in this chunk.
    pub fn row_count(&self) -> usize {
        self.segments.first().map_or(0, Segment::row_count)
    }
}

/// A fully assembled table in ingestion order.
#[derive(Debug, Clone)]
pub struct Table {
    /// Table name, lowercased on ingest.
    pub name: String,

    /// Schema columns in declaration order.
    pub columns: Vec<ColumnDefinition>,

    /// Chunks in ingestion order.
    pub chunks: Vec<Chunk>,
}

impl Table {
    /// Total rows across all chunks.
    pub fn row_count(&self) -> usize {
        self.chunks.iter().map(Chunk::row_count).sum()
    }
}
