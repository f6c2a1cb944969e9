//! Consumer side of the ingestion pipeline.
//!
//! The reader owns every named OS resource of the protocol: it creates the
//! shared-memory region and both semaphores (discarding stale instances
//! first), drains control cells into table builders, and hands each data
//! slot back to the producer as soon as the cell referencing it has been
//! consumed. All resources are unlinked again when the reader drops,
//! whichever way the stream ended.

use crate::error::{DgateError, Result};
use crate::ring::MultiProcessRingBuffer;
use crate::shm::{CellKind, DataCellView, SharedMemoryRegion, ShmLayout};
use crate::table::{Table, TableBuilder};

/// Drains the control-cell stream of one generator run into tables.
pub struct SharedMemoryReader {
    chunk_size: u32,

    // Declared before the region so the ring's semaphores release first,
    // in reverse construction order.
    ring: MultiProcessRingBuffer,
    region: SharedMemoryRegion,

    /// Learned from the first TABLE_SCHEMA cell; until then the stream is
    /// assumed to hold at least one more table.
    num_tables_to_read: Option<u32>,
    num_read_tables: u32,
}

impl SharedMemoryReader {
    /// Creates the shared resources under the given names and prepares the
    /// ring for the producer to attach.
    ///
    /// Output tables are chunked to `chunk_size` rows.
    pub fn new(
        chunk_size: u32,
        shared_memory_name: &str,
        data_ready_name: &str,
        buffer_free_name: &str,
        layout: ShmLayout,
    ) -> Result<Self> {
        let region = SharedMemoryRegion::create(shared_memory_name, layout)?;
        let ring =
            MultiProcessRingBuffer::create_for_reader(&region, data_ready_name, buffer_free_name)?;
        Ok(Self {
            chunk_size,
            region,
            ring,
            num_tables_to_read: None,
            num_read_tables: 0,
        })
    }

    /// Creates a reader under the protocol's default names and geometry.
    pub fn with_default_names(chunk_size: u32) -> Result<Self> {
        Self::new(
            chunk_size,
            crate::shm::SHARED_MEMORY_NAME,
            crate::shm::DATA_READY_SEM,
            crate::shm::BUFFER_FREE_SEM,
            ShmLayout::default(),
        )
    }

    /// The mapped region, for producing-side code sharing this process
    /// (mock producers in tests and examples).
    pub fn region(&self) -> &SharedMemoryRegion {
        &self.region
    }

    /// Table count announced by the stream, once known.
    pub fn expected_tables(&self) -> Option<u32> {
        self.num_tables_to_read
    }

    /// True until every announced table has been drained. The reader never
    /// touches the semaphores once this turns false.
    pub fn has_next_table(&self) -> bool {
        match self.num_tables_to_read {
            None => true,
            Some(expected) => self.num_read_tables < expected,
        }
    }

    /// Drains one table's cell stream and returns its finished builder.
    pub fn read_next_table(&mut self) -> Result<TableBuilder> {
        let work_unit_size = self.region.layout().work_unit_size;

        let (offset, table_id, _) = self.next_cell(CellKind::TableSchema)?;
        if self.num_tables_to_read.is_none() {
            let expected = self.slot_view(offset)?.read_u32(0)?;
            tracing::info!(tables = expected, "stream announced table count");
            self.num_tables_to_read = Some(expected);
        }
        let mut builder = TableBuilder::new(table_id, self.chunk_size, work_unit_size);
        builder.read_schema(&self.slot_view(offset)?)?;
        self.return_data_slot(offset)?;

        if builder.expects_more_data() {
            let (offset, _, _) = self.next_cell(CellKind::TableGenerationInfo)?;
            builder.read_generation_info(&self.slot_view(offset)?)?;
            self.return_data_slot(offset)?;

            while builder.expects_more_data() {
                let (offset, table_id, sorting_id) = self.next_cell(CellKind::Data)?;
                builder.read_data(table_id, sorting_id, &self.slot_view(offset)?)?;
                self.return_data_slot(offset)?;
            }
        }

        let (offset, _, _) = self.next_cell(CellKind::TableCompleted)?;
        builder.complete()?;
        self.num_read_tables += 1;
        self.return_data_slot(offset)?;

        Ok(builder)
    }

    /// Drains every announced table and assembles them in stream order.
    pub fn read_tables(&mut self) -> Result<Vec<Table>> {
        let mut tables = Vec::new();
        while self.has_next_table() {
            tables.push(self.read_next_table()?.build_table()?);
        }
        Ok(tables)
    }

    /// Retrieves the next cell, requiring `expected`, and captures its
    /// routing fields before releasing the read side.
    fn next_cell(&self, expected: CellKind) -> Result<(u32, u32, i64)> {
        let retrieval = self.ring.prepare_retrieval()?;
        let cell = retrieval.cell();
        let kind = cell.kind()?;
        if kind != expected {
            return Err(DgateError::UnexpectedCell {
                expected: expected.name(),
                actual: cell.cell_type,
            });
        }
        let captured = (cell.data_buffer_offset, cell.table_id, cell.sorting_id);
        retrieval.finish();
        Ok(captured)
    }

    fn slot_view(&self, offset: u32) -> Result<DataCellView<'_>> {
        let layout = self.region.layout();
        Ok(DataCellView::new(
            self.region.data_slot(offset)?,
            layout.column_count,
            layout.field_size,
        ))
    }

    /// Hands a data slot back to the producer as a NOOP cell; posting
    /// `buffer-free` happens inside the write finish.
    fn return_data_slot(&self, offset: u32) -> Result<()> {
        let mut writing = self.ring.prepare_writing()?;
        writing.cell_mut().write_noop(offset);
        writing.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::shm::write_string_field;
    use crate::table::{Chunk, ColumnType, Segment};

    const FIELD_SIZE: u32 = 32;

    fn test_layout() -> ShmLayout {
        // Slots of 8×2 fields: big enough for a two-column schema payload.
        ShmLayout {
            work_unit_size: 8,
            column_count: 2,
            field_size: FIELD_SIZE,
            field_slot_budget: 64,
            data_pool_offset: 4096,
        }
    }

    struct Names {
        shm: String,
        ready: String,
        free: String,
    }

    fn names(tag: &str) -> Names {
        let pid = std::process::id();
        Names {
            shm: format!("/dgate_test_reader_{tag}_{pid}"),
            ready: format!("/dgate_test_reader_{tag}_ready_{pid}"),
            free: format!("/dgate_test_reader_{tag}_free_{pid}"),
        }
    }

    fn reader(names: &Names) -> SharedMemoryReader {
        SharedMemoryReader::new(3, &names.shm, &names.ready, &names.free, test_layout()).unwrap()
    }

    /// In-process stand-in for the external generator.
    struct MockProducer {
        region: SharedMemoryRegion,
        ring: MultiProcessRingBuffer,
    }

    impl MockProducer {
        fn attach(names: &Names) -> Self {
            let region = SharedMemoryRegion::attach(&names.shm, test_layout()).unwrap();
            let ring =
                MultiProcessRingBuffer::attach_for_producer(&region, &names.ready, &names.free)
                    .unwrap();
            Self { region, ring }
        }

        /// Takes a free slot, fills it, and publishes a cell referencing it.
        fn send(
            &self,
            kind: u32,
            table_id: u32,
            sorting_id: i64,
            fill: impl FnOnce(&mut SlotWriter<'_>),
        ) {
            let retrieval = self.ring.prepare_retrieval().unwrap();
            let offset = retrieval.cell().data_buffer_offset;
            retrieval.finish();

            let slot = unsafe { self.region.data_slot_mut(offset).unwrap() };
            slot.fill(0);
            fill(&mut SlotWriter { slot });

            let mut writing = self.ring.prepare_writing().unwrap();
            let cell = writing.cell_mut();
            cell.cell_type = kind;
            cell.data_buffer_offset = offset;
            cell.table_id = table_id;
            cell.sorting_id = sorting_id;
            writing.finish().unwrap();
        }

        fn send_schema(
            &self,
            table_id: u32,
            num_tables: u32,
            name: &str,
            num_rows: i64,
            generated: bool,
            columns: &[(&str, ColumnType)],
        ) {
            self.send(CellKind::TableSchema as u32, table_id, 0, |slot| {
                slot.put_u32(0, num_tables);
                slot.put_str(1, name);
                slot.put_i64(2, num_rows);
                slot.put_u32(3, generated as u32);
                slot.put_u32(4, columns.len() as u32);
                for (i, (name, column_type)) in columns.iter().enumerate() {
                    slot.put_str(5 + 2 * i as u32, name);
                    slot.put_u32(6 + 2 * i as u32, *column_type as u32);
                }
            });
        }

        fn send_generation_info(&self, table_id: u32, columns: &[&str]) {
            self.send(CellKind::TableGenerationInfo as u32, table_id, 0, |slot| {
                slot.put_u32(0, table_id);
                slot.put_u32(1, columns.len() as u32);
                for (i, name) in columns.iter().enumerate() {
                    slot.put_str(2 + i as u32, name);
                }
            });
        }

        /// One data cell with `values` in column position 0.
        fn send_data(&self, table_id: u32, sorting_id: i64, values: &[i32]) {
            self.send(CellKind::Data as u32, table_id, sorting_id, |slot| {
                for (row, value) in values.iter().enumerate() {
                    slot.put_i32(row as u32 * 2, *value);
                }
            });
        }

        fn send_completed(&self, table_id: u32) {
            self.send(CellKind::TableCompleted as u32, table_id, 0, |_| {});
        }
    }

    struct SlotWriter<'a> {
        slot: &'a mut [u8],
    }

    impl SlotWriter<'_> {
        fn field_mut(&mut self, index: u32) -> &mut [u8] {
            let start = (index * FIELD_SIZE) as usize;
            &mut self.slot[start..start + FIELD_SIZE as usize]
        }

        fn put_u32(&mut self, index: u32, value: u32) {
            self.field_mut(index)[..4].copy_from_slice(&value.to_le_bytes());
        }

        fn put_i32(&mut self, index: u32, value: i32) {
            self.field_mut(index)[..4].copy_from_slice(&value.to_le_bytes());
        }

        fn put_i64(&mut self, index: u32, value: i64) {
            self.field_mut(index)[..8].copy_from_slice(&value.to_le_bytes());
        }

        fn put_str(&mut self, index: u32, value: &str) {
            write_string_field(self.field_mut(index), value);
        }
    }

    fn integer_column(table: &Table, column: usize) -> Vec<i32> {
        table
            .chunks
            .iter()
            .flat_map(|chunk| match &chunk.segments[column] {
                Segment::Integer(values) => values.clone(),
                other => panic!("expected integer segment, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn single_table_stream_end_to_end() {
        let names = names("single");
        let mut reader = reader(&names);

        let producer = MockProducer::attach(&names);
        let feed = thread::spawn(move || {
            producer.send_schema(
                0,
                1,
                "t",
                5,
                true,
                &[("a", ColumnType::Integer), ("b", ColumnType::String)],
            );
            producer.send_generation_info(0, &["a"]);
            producer.send_data(0, 0, &[10, 11, 20, 21, 30]);
            producer.send_completed(0);
        });

        assert!(reader.has_next_table());
        let table = reader.read_next_table().unwrap().build_table().unwrap();
        assert!(!reader.has_next_table());
        assert_eq!(reader.expected_tables(), Some(1));
        feed.join().unwrap();

        assert_eq!(table.name, "t");
        assert_eq!(table.chunks.len(), 2);
        assert_eq!(table.chunks[0].row_count(), 3);
        assert_eq!(table.chunks[1].row_count(), 2);
        assert_eq!(integer_column(&table, 0), vec![10, 11, 20, 21, 30]);
        assert_eq!(
            table.chunks[0].segments[1],
            Segment::Placeholder {
                column_type: ColumnType::String,
                row_count: 3
            }
        );

        // Every consumed cell handed its slot back to the producer.
        assert_eq!(reader.ring.cells_read(), 4);
        assert_eq!(reader.ring.cells_written(), 4);
    }

    #[test]
    fn shuffled_sorting_ids_yield_the_same_table() {
        let names = names("shuffled");
        let mut reader = reader(&names);

        let producer = MockProducer::attach(&names);
        let feed = thread::spawn(move || {
            producer.send_schema(0, 1, "t", 10, true, &[("a", ColumnType::Integer)]);
            producer.send_generation_info(0, &["a"]);
            // The short final work unit arrives before the first one.
            producer.send_data(0, 1, &[80, 90]);
            producer.send_data(0, 0, &[0, 10, 20, 30, 40, 50, 60, 70]);
            producer.send_completed(0);
        });

        let table = reader.read_next_table().unwrap().build_table().unwrap();
        feed.join().unwrap();

        assert_eq!(
            integer_column(&table, 0),
            vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90]
        );
        let chunk_sizes: Vec<usize> = table.chunks.iter().map(Chunk::row_count).collect();
        assert_eq!(chunk_sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn non_generated_tables_consume_no_data_cells() {
        let names = names("nongen");
        let mut reader = reader(&names);

        let producer = MockProducer::attach(&names);
        let feed = thread::spawn(move || {
            producer.send_schema(0, 1, "u", 3, false, &[("x", ColumnType::Long)]);
            producer.send_completed(0);
        });

        let table = reader.read_next_table().unwrap().build_table().unwrap();
        feed.join().unwrap();

        assert_eq!(table.name, "u");
        assert_eq!(table.chunks.len(), 1);
        assert_eq!(
            table.chunks[0].segments[0],
            Segment::Placeholder {
                column_type: ColumnType::Long,
                row_count: 3
            }
        );
        assert_eq!(reader.ring.cells_read(), 2);
    }

    #[test]
    fn table_count_bounds_the_stream() {
        let names = names("multi");
        let mut reader = reader(&names);

        let producer = MockProducer::attach(&names);
        let feed = thread::spawn(move || {
            producer.send_schema(0, 2, "first", 2, false, &[("x", ColumnType::Integer)]);
            producer.send_completed(0);
            producer.send_schema(1, 2, "second", 1, false, &[("y", ColumnType::Double)]);
            producer.send_completed(1);
        });

        let tables = reader.read_tables().unwrap();
        feed.join().unwrap();

        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].name, "first");
        assert_eq!(tables[1].name, "second");
        assert_eq!(reader.expected_tables(), Some(2));
        assert!(!reader.has_next_table());
    }

    #[test]
    fn skipped_generation_info_is_a_protocol_violation() {
        let names = names("violation");
        let shm_path = format!("/dev/shm{}", names.shm);
        let mut reader = reader(&names);

        let producer = MockProducer::attach(&names);
        let feed = thread::spawn(move || {
            producer.send_schema(0, 1, "t", 5, true, &[("a", ColumnType::Integer)]);
            producer.send_data(0, 0, &[1, 2, 3, 4, 5]);
        });

        let err = reader.read_next_table().unwrap_err();
        feed.join().unwrap();
        assert!(matches!(
            err,
            DgateError::UnexpectedCell {
                expected: "TABLE_GENERATION_INFO",
                actual: 3,
            }
        ));

        // The abort path still unlinks every named resource.
        drop(reader);
        assert!(!std::path::Path::new(&shm_path).exists());
        assert!(crate::ring::NamedSemaphore::open(&names.ready).is_err());
        assert!(crate::ring::NamedSemaphore::open(&names.free).is_err());
    }

    #[test]
    fn unknown_cell_tags_are_rejected() {
        let names = names("unknown");
        let mut reader = reader(&names);

        let producer = MockProducer::attach(&names);
        let feed = thread::spawn(move || {
            producer.send(99, 0, 0, |_| {});
        });

        let err = reader.read_next_table().unwrap_err();
        feed.join().unwrap();
        assert!(matches!(err, DgateError::UnknownCellKind(99)));
    }
}
