//! Per-table state machine over the control-cell stream.
//!
//! A builder is created when a TABLE_SCHEMA cell arrives and walks through
//! generation info and data cells until TABLE_COMPLETED, at which point it
//! can be turned into an assembled [`Table`]. Every entry point re-checks
//! the lifecycle state, independent of the reader's own tag assertions.

use crate::error::{DgateError, Result};
use crate::shm::DataCellView;
use crate::table::{Chunk, ColumnAccumulator, ColumnDefinition, ColumnType, Table};

/// Schema payload: flat field index of the table name. Field 0 carries the
/// stream-wide table count and belongs to the reader.
const SCHEMA_NAME_FIELD: u32 = 1;
const SCHEMA_NUM_ROWS_FIELD: u32 = 2;
const SCHEMA_GENERATED_FIELD: u32 = 3;
const SCHEMA_NUM_COLUMNS_FIELD: u32 = 4;
const SCHEMA_COLUMNS_FIELD: u32 = 5;

/// Generation-info payload: flat field indices.
const INFO_TABLE_ID_FIELD: u32 = 0;
const INFO_NUM_COLUMNS_FIELD: u32 = 1;
const INFO_COLUMNS_FIELD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuilderState {
    AwaitingSchema,
    AwaitingGenerationInfo,
    ReceivingData,
    AwaitingCompletion,
    Done,
}

impl BuilderState {
    fn describe(self) -> &'static str {
        match self {
            BuilderState::AwaitingSchema => "awaiting the table schema",
            BuilderState::AwaitingGenerationInfo => "awaiting generation info",
            BuilderState::ReceivingData => "receiving data",
            BuilderState::AwaitingCompletion => "awaiting completion",
            BuilderState::Done => "done",
        }
    }
}

/// Assembles one table from its slice of the control-cell stream.
#[derive(Debug)]
pub struct TableBuilder {
    table_id: u32,
    chunk_size: u32,
    work_unit_size: u32,

    state: BuilderState,
    name: String,
    num_rows: i64,
    will_be_generated: bool,
    columns: Vec<ColumnDefinition>,
    accumulators: Vec<ColumnAccumulator>,

    /// Maps a data cell's column position to its schema index.
    generated_columns: Vec<usize>,

    received_rows: i64,
}

impl TableBuilder {
    /// A builder for the table a TABLE_SCHEMA cell announced.
    pub fn new(table_id: u32, chunk_size: u32, work_unit_size: u32) -> Self {
        Self {
            table_id,
            chunk_size,
            work_unit_size,
            state: BuilderState::AwaitingSchema,
            name: String::new(),
            num_rows: 0,
            will_be_generated: false,
            columns: Vec::new(),
            accumulators: Vec::new(),
            generated_columns: Vec::new(),
            received_rows: 0,
        }
    }

    /// Id of the table this builder assembles.
    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    /// Table name; empty until the schema has been read.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rows the schema declared.
    pub fn num_rows(&self) -> i64 {
        self.num_rows
    }

    /// Rows received through data cells so far.
    pub fn received_rows(&self) -> i64 {
        self.received_rows
    }

    /// True while the producer still owes this table generated rows.
    pub fn expects_more_data(&self) -> bool {
        self.will_be_generated && self.received_rows < self.num_rows
    }

    fn check_state(&self, expected: BuilderState, operation: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(DgateError::BuilderState {
                operation,
                state: self.state.describe(),
            });
        }
        Ok(())
    }

    fn check_table_id(&self, table_id: u32) -> Result<()> {
        if table_id != self.table_id {
            return Err(DgateError::TableIdMismatch {
                expected: self.table_id,
                actual: table_id,
            });
        }
        Ok(())
    }

    /// Consumes a TABLE_SCHEMA payload: table name, row count, whether the
    /// table is generated at all, and the full column schema. Every column
    /// starts out as a placeholder.
    pub fn read_schema(&mut self, payload: &DataCellView<'_>) -> Result<()> {
        self.check_state(BuilderState::AwaitingSchema, "schema")?;

        self.name = payload.read_string(SCHEMA_NAME_FIELD)?.to_lowercase();
        self.num_rows = payload.read_i64(SCHEMA_NUM_ROWS_FIELD)?;
        self.will_be_generated = payload.read_bool(SCHEMA_GENERATED_FIELD)?;

        let num_columns = payload.read_u32(SCHEMA_NUM_COLUMNS_FIELD)?;
        for i in 0..num_columns {
            let name = payload.read_string(SCHEMA_COLUMNS_FIELD + 2 * i)?.to_lowercase();
            let column_type =
                ColumnType::try_from(payload.read_u32(SCHEMA_COLUMNS_FIELD + 2 * i + 1)?)?;
            self.columns.push(ColumnDefinition { name, column_type });
            self.accumulators.push(ColumnAccumulator::placeholder(
                column_type,
                self.num_rows,
                self.chunk_size,
            ));
        }

        tracing::debug!(
            table = %self.name,
            table_id = self.table_id,
            rows = self.num_rows,
            columns = self.columns.len(),
            generated = self.will_be_generated,
            "read table schema"
        );

        self.state = if self.expects_more_data() {
            BuilderState::AwaitingGenerationInfo
        } else {
            BuilderState::AwaitingCompletion
        };
        Ok(())
    }

    /// Consumes a TABLE_GENERATION_INFO payload: the columns the producer
    /// will actually emit, in data-cell position order. Each named column's
    /// placeholder is replaced by a value-owning accumulator.
    pub fn read_generation_info(&mut self, payload: &DataCellView<'_>) -> Result<()> {
        self.check_state(BuilderState::AwaitingGenerationInfo, "generation info")?;
        self.check_table_id(payload.read_u32(INFO_TABLE_ID_FIELD)?)?;

        let num_generated = payload.read_u32(INFO_NUM_COLUMNS_FIELD)?;
        for i in 0..num_generated {
            let name = payload.read_string(INFO_COLUMNS_FIELD + i)?.to_lowercase();
            let schema_index = self
                .columns
                .iter()
                .position(|column| column.name == name)
                .ok_or_else(|| DgateError::UnknownGeneratedColumn {
                    table: self.name.clone(),
                    name: name.clone(),
                })?;

            self.accumulators[schema_index] = ColumnAccumulator::generated(
                self.columns[schema_index].column_type,
                self.num_rows,
                self.chunk_size,
            );
            self.generated_columns.push(schema_index);
            tracing::debug!(
                table = %self.name,
                column = %name,
                cell_position = i,
                schema_index,
                "column will be generated"
            );
        }

        self.state = BuilderState::ReceivingData;
        Ok(())
    }

    /// Consumes a DATA cell: up to one work unit of rows, placed at the
    /// absolute positions the sorting id dictates.
    ///
    /// The row count is derived from the cell's own position in the table,
    /// not from how many rows arrived before it, so shuffled sorting-id
    /// arrival assembles the same table.
    pub fn read_data(
        &mut self,
        table_id: u32,
        sorting_id: i64,
        cell: &DataCellView<'_>,
    ) -> Result<()> {
        self.check_state(BuilderState::ReceivingData, "data")?;
        self.check_table_id(table_id)?;

        let base_row = sorting_id * self.work_unit_size as i64;
        if sorting_id < 0 {
            return Err(DgateError::RowOutOfRange {
                row: base_row,
                num_rows: self.num_rows,
            });
        }
        let cell_rows = (self.num_rows - base_row).clamp(0, self.work_unit_size as i64);
        tracing::trace!(
            table = %self.name,
            sorting_id,
            rows = cell_rows,
            "reading data cell"
        );

        for row in 0..cell_rows {
            for (cell_position, &schema_index) in self.generated_columns.iter().enumerate() {
                let field = cell.data_field(row as u32, cell_position as u32)?;
                self.accumulators[schema_index].add(base_row + row, field)?;
            }
        }
        self.received_rows += cell_rows;

        if !self.expects_more_data() {
            self.state = BuilderState::AwaitingCompletion;
        }
        Ok(())
    }

    /// Consumes the TABLE_COMPLETED cell. Every declared row must have
    /// arrived (or the table must be non-generated).
    pub fn complete(&mut self) -> Result<()> {
        match self.state {
            BuilderState::AwaitingCompletion => {
                self.state = BuilderState::Done;
                tracing::debug!(table = %self.name, rows = self.received_rows, "table completed");
                Ok(())
            }
            BuilderState::AwaitingGenerationInfo | BuilderState::ReceivingData => {
                Err(DgateError::IncompleteTable {
                    table: self.name.clone(),
                    received: self.received_rows,
                    expected: self.num_rows,
                })
            }
            state => Err(DgateError::BuilderState {
                operation: "completion",
                state: state.describe(),
            }),
        }
    }

    /// Assembles the finished table, walking all columns in lockstep: one
    /// chunk per round, one segment per column, equal row counts throughout.
    pub fn build_table(mut self) -> Result<Table> {
        self.check_state(BuilderState::Done, "build_table")?;

        let mut chunks = Vec::new();
        while self.accumulators.iter().any(ColumnAccumulator::has_another_segment) {
            let mut segments = Vec::with_capacity(self.accumulators.len());
            let mut chunk_rows = None;
            for (column, accumulator) in self.accumulators.iter_mut().enumerate() {
                let segment = accumulator
                    .build_next_segment()
                    .ok_or(DgateError::SegmentCountMismatch { column })?;
                let rows = segment.row_count();
                match chunk_rows {
                    None => chunk_rows = Some(rows),
                    Some(expected) if expected != rows => {
                        return Err(DgateError::ChunkRowMismatch {
                            column,
                            expected,
                            actual: rows,
                        });
                    }
                    Some(_) => {}
                }
                segments.push(segment);
            }
            chunks.push(Chunk { segments });
        }

        Ok(Table {
            name: self.name,
            columns: self.columns,
            chunks,
        })
    }
}
