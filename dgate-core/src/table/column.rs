//! Per-column staging of incoming row values.
//!
//! Accumulators pre-allocate every segment to full width when the table is
//! created, so a data cell's rows can be written at their absolute position
//! in O(1) regardless of arrival order. The hot path allocates nothing
//! beyond the owned string values themselves.

use crate::error::{DgateError, Result};
use crate::shm::decode_string_field;
use crate::table::{ColumnType, Segment};

/// Number of segments a column of `num_rows` rows splits into.
fn segment_count(num_rows: i64, chunk_size: u32) -> usize {
    if num_rows <= 0 {
        0
    } else {
        ((num_rows - 1) / chunk_size as i64 + 1) as usize
    }
}

/// Row count of segment `index`.
fn segment_rows(num_rows: i64, chunk_size: u32, index: usize) -> u32 {
    let start = index as i64 * chunk_size as i64;
    (num_rows - start).min(chunk_size as i64).max(0) as u32
}

/// Typed value storage of a generated column, one vector per segment.
#[derive(Debug)]
enum ValueBuffers {
    String(Vec<Vec<String>>),
    Integer(Vec<Vec<i32>>),
    Long(Vec<Vec<i64>>),
    Double(Vec<Vec<f64>>),
}

impl ValueBuffers {
    fn allocate(column_type: ColumnType, num_rows: i64, chunk_size: u32) -> Self {
        let sizes: Vec<usize> = (0..segment_count(num_rows, chunk_size))
            .map(|i| segment_rows(num_rows, chunk_size, i) as usize)
            .collect();

        fn vectors<T: Clone + Default>(sizes: &[usize]) -> Vec<Vec<T>> {
            sizes.iter().map(|&n| vec![T::default(); n]).collect()
        }

        match column_type {
            ColumnType::String => ValueBuffers::String(vectors(&sizes)),
            // BOOL travels as a 32-bit integer in {0, 1}.
            ColumnType::Integer | ColumnType::Bool => ValueBuffers::Integer(vectors(&sizes)),
            ColumnType::Long => ValueBuffers::Long(vectors(&sizes)),
            ColumnType::Double => ValueBuffers::Double(vectors(&sizes)),
        }
    }
}

/// A column whose values arrive in data cells.
#[derive(Debug)]
pub struct GeneratedColumn {
    num_rows: i64,
    chunk_size: u32,
    built_segments: usize,
    buffers: ValueBuffers,
}

impl GeneratedColumn {
    fn new(column_type: ColumnType, num_rows: i64, chunk_size: u32) -> Self {
        Self {
            num_rows,
            chunk_size,
            built_segments: 0,
            buffers: ValueBuffers::allocate(column_type, num_rows, chunk_size),
        }
    }

    /// Decodes one field into the value at absolute row position `row`.
    fn add(&mut self, row: i64, field: &[u8]) -> Result<()> {
        if row < 0 || row >= self.num_rows {
            return Err(DgateError::RowOutOfRange {
                row,
                num_rows: self.num_rows,
            });
        }
        let segment = (row / self.chunk_size as i64) as usize;
        let position = (row % self.chunk_size as i64) as usize;

        match &mut self.buffers {
            ValueBuffers::String(segments) => {
                segments[segment][position] = decode_string_field(field);
            }
            ValueBuffers::Integer(segments) => {
                segments[segment][position] = bytemuck::pod_read_unaligned(&field[..4]);
            }
            ValueBuffers::Long(segments) => {
                segments[segment][position] = bytemuck::pod_read_unaligned(&field[..8]);
            }
            ValueBuffers::Double(segments) => {
                segments[segment][position] = bytemuck::pod_read_unaligned(&field[..8]);
            }
        }
        Ok(())
    }

    fn has_another_segment(&self) -> bool {
        self.built_segments < segment_count(self.num_rows, self.chunk_size)
    }

    fn build_next_segment(&mut self) -> Option<Segment> {
        if !self.has_another_segment() {
            return None;
        }
        let index = self.built_segments;
        self.built_segments += 1;
        Some(match &mut self.buffers {
            ValueBuffers::String(segments) => Segment::String(std::mem::take(&mut segments[index])),
            ValueBuffers::Integer(segments) => {
                Segment::Integer(std::mem::take(&mut segments[index]))
            }
            ValueBuffers::Long(segments) => Segment::Long(std::mem::take(&mut segments[index])),
            ValueBuffers::Double(segments) => Segment::Double(std::mem::take(&mut segments[index])),
        })
    }
}

/// A schema column the producer never generates; it tracks only its logical
/// row count so chunks stay column-aligned.
#[derive(Debug)]
pub struct PlaceholderColumn {
    column_type: ColumnType,
    num_rows: i64,
    chunk_size: u32,
    built_segments: usize,
}

impl PlaceholderColumn {
    fn new(column_type: ColumnType, num_rows: i64, chunk_size: u32) -> Self {
        Self {
            column_type,
            num_rows,
            chunk_size,
            built_segments: 0,
        }
    }

    fn has_another_segment(&self) -> bool {
        self.built_segments < segment_count(self.num_rows, self.chunk_size)
    }

    fn build_next_segment(&mut self) -> Option<Segment> {
        if !self.has_another_segment() {
            return None;
        }
        let row_count = segment_rows(self.num_rows, self.chunk_size, self.built_segments);
        self.built_segments += 1;
        Some(Segment::Placeholder {
            column_type: self.column_type,
            row_count,
        })
    }
}

/// Staging for one schema column: either values as they arrive, or a
/// row-count-only placeholder.
#[derive(Debug)]
pub enum ColumnAccumulator {
    /// The producer emits values for this column.
    Generated(GeneratedColumn),

    /// The producer skips this column; only its size is tracked.
    Placeholder(PlaceholderColumn),
}

impl ColumnAccumulator {
    /// A value-owning accumulator with all segments pre-allocated.
    pub fn generated(column_type: ColumnType, num_rows: i64, chunk_size: u32) -> Self {
        ColumnAccumulator::Generated(GeneratedColumn::new(column_type, num_rows, chunk_size))
    }

    /// A size-only accumulator.
    pub fn placeholder(column_type: ColumnType, num_rows: i64, chunk_size: u32) -> Self {
        ColumnAccumulator::Placeholder(PlaceholderColumn::new(column_type, num_rows, chunk_size))
    }

    /// Decodes one field into absolute row position `row`. Illegal on a
    /// placeholder column.
    pub fn add(&mut self, row: i64, field: &[u8]) -> Result<()> {
        match self {
            ColumnAccumulator::Generated(column) => column.add(row, field),
            ColumnAccumulator::Placeholder(_) => Err(DgateError::PlaceholderAdd),
        }
    }

    /// True while unemitted segments remain.
    pub fn has_another_segment(&self) -> bool {
        match self {
            ColumnAccumulator::Generated(column) => column.has_another_segment(),
            ColumnAccumulator::Placeholder(column) => column.has_another_segment(),
        }
    }

    /// Moves the next prepared segment out, or `None` when exhausted.
    pub fn build_next_segment(&mut self) -> Option<Segment> {
        match self {
            ColumnAccumulator::Generated(column) => column.build_next_segment(),
            ColumnAccumulator::Placeholder(column) => column.build_next_segment(),
        }
    }
}
