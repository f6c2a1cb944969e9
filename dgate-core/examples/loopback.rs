//! Loopback demonstration of the ingestion protocol.
//!
//! A mock producer thread plays the external generator's role: it attaches
//! to the region and semaphores the reader created, streams one small table
//! through the ring, and exits. The main thread drains the stream and
//! prints the assembled chunks.

use std::thread;

use anyhow::{Context, Result};
use dgate_core::ring::MultiProcessRingBuffer;
use dgate_core::shm::{write_string_field, CellKind, SharedMemoryRegion};
use dgate_core::table::ColumnType;
use dgate_core::{Segment, SharedMemoryReader, ShmLayout};

const SHM_NAME: &str = "/dgate_loopback_shm";
const DATA_READY: &str = "/dgate_loopback_data_ready";
const BUFFER_FREE: &str = "/dgate_loopback_buffer_free";

const FIELD_SIZE: u32 = 32;

fn layout() -> ShmLayout {
    ShmLayout {
        work_unit_size: 8,
        column_count: 2,
        field_size: FIELD_SIZE,
        field_slot_budget: 64,
        data_pool_offset: 4096,
    }
}

fn field_mut(slot: &mut [u8], index: u32) -> &mut [u8] {
    let start = (index * FIELD_SIZE) as usize;
    &mut slot[start..start + FIELD_SIZE as usize]
}

fn put_u32(slot: &mut [u8], index: u32, value: u32) {
    field_mut(slot, index)[..4].copy_from_slice(&value.to_le_bytes());
}

fn put_i32(slot: &mut [u8], index: u32, value: i32) {
    field_mut(slot, index)[..4].copy_from_slice(&value.to_le_bytes());
}

fn put_i64(slot: &mut [u8], index: u32, value: i64) {
    field_mut(slot, index)[..8].copy_from_slice(&value.to_le_bytes());
}

fn put_str(slot: &mut [u8], index: u32, value: &str) {
    write_string_field(field_mut(slot, index), value);
}

/// One producer step: take a free slot, fill it, publish a cell over it.
fn send(
    region: &SharedMemoryRegion,
    ring: &MultiProcessRingBuffer,
    kind: CellKind,
    table_id: u32,
    sorting_id: i64,
    fill: impl FnOnce(&mut [u8]),
) -> Result<()> {
    let retrieval = ring.prepare_retrieval()?;
    let offset = retrieval.cell().data_buffer_offset;
    retrieval.finish();

    // Safety: the buffer-free credit just granted us exclusive ownership of
    // this slot until the cell below hands it to the reader.
    let slot = unsafe { region.data_slot_mut(offset)? };
    slot.fill(0);
    fill(slot);

    let mut writing = ring.prepare_writing()?;
    let cell = writing.cell_mut();
    cell.cell_type = kind as u32;
    cell.data_buffer_offset = offset;
    cell.table_id = table_id;
    cell.sorting_id = sorting_id;
    writing.finish()?;
    Ok(())
}

/// Streams table "nation": 5 rows, both columns generated.
fn produce() -> Result<()> {
    let region = SharedMemoryRegion::attach(SHM_NAME, layout())?;
    let ring = MultiProcessRingBuffer::attach_for_producer(&region, DATA_READY, BUFFER_FREE)?;

    send(&region, &ring, CellKind::TableSchema, 0, 0, |slot| {
        put_u32(slot, 0, 1); // one table in this stream
        put_str(slot, 1, "nation");
        put_i64(slot, 2, 5);
        put_u32(slot, 3, 1); // generated
        put_u32(slot, 4, 2);
        put_str(slot, 5, "n_nationkey");
        put_u32(slot, 6, ColumnType::Integer as u32);
        put_str(slot, 7, "n_name");
        put_u32(slot, 8, ColumnType::String as u32);
    })?;

    send(&region, &ring, CellKind::TableGenerationInfo, 0, 0, |slot| {
        put_u32(slot, 0, 0);
        put_u32(slot, 1, 2);
        put_str(slot, 2, "n_nationkey");
        put_str(slot, 3, "n_name");
    })?;

    let names = ["ALGERIA", "ARGENTINA", "BRAZIL", "CANADA", "EGYPT"];
    send(&region, &ring, CellKind::Data, 0, 0, |slot| {
        for (row, name) in names.iter().enumerate() {
            put_i32(slot, row as u32 * 2, row as i32);
            put_str(slot, row as u32 * 2 + 1, name);
        }
    })?;

    send(&region, &ring, CellKind::TableCompleted, 0, 0, |_| {})?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // The reader must come first: it creates the resources the producer
    // binds to.
    let mut reader = SharedMemoryReader::new(3, SHM_NAME, DATA_READY, BUFFER_FREE, layout())
        .context("creating shared memory reader")?;

    let producer = thread::spawn(produce);

    let tables = reader.read_tables().context("draining the stream")?;
    producer.join().expect("producer thread panicked")?;

    for table in &tables {
        println!(
            "table {:?}: {} rows in {} chunks",
            table.name,
            table.row_count(),
            table.chunks.len()
        );
        for (i, chunk) in table.chunks.iter().enumerate() {
            println!("  chunk {i} ({} rows)", chunk.row_count());
            for (column, segment) in table.columns.iter().zip(&chunk.segments) {
                match segment {
                    Segment::Integer(values) => println!("    {}: {values:?}", column.name),
                    Segment::String(values) => println!("    {}: {values:?}", column.name),
                    Segment::Long(values) => println!("    {}: {values:?}", column.name),
                    Segment::Double(values) => println!("    {}: {values:?}", column.name),
                    Segment::Placeholder { row_count, .. } => {
                        println!("    {}: <{row_count} placeholder rows>", column.name)
                    }
                }
            }
        }
    }

    Ok(())
}
