//! Wire layout shared with the external generator.
//!
//! The structures in this module are written by another runtime (the
//! generator's JVM) and read here, so every layout decision is explicit:
//! fixed-width integers, `#[repr(C)]`, no implicit padding, little-endian
//! numeric fields. Changing any of them breaks the cross-process contract.

use bytemuck::{Pod, Zeroable};

use crate::error::{DgateError, Result};

/// Tag of a control cell in the ring.
///
/// The numeric values are fixed by the generator build and travel over
/// shared memory verbatim.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// Declares a table: name, row count, column schema.
    TableSchema = 1,

    /// Lists the columns the generator will actually emit values for.
    TableGenerationInfo = 2,

    /// Carries up to one work unit of generated rows.
    Data = 3,

    /// Marks the end of one table's stream.
    TableCompleted = 4,

    /// Returns a data slot from the consumer back to the producer.
    Noop = 42,
}

impl CellKind {
    /// Protocol name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            CellKind::TableSchema => "TABLE_SCHEMA",
            CellKind::TableGenerationInfo => "TABLE_GENERATION_INFO",
            CellKind::Data => "DATA",
            CellKind::TableCompleted => "TABLE_COMPLETED",
            CellKind::Noop => "NOOP",
        }
    }
}

impl TryFrom<u32> for CellKind {
    type Error = DgateError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(CellKind::TableSchema),
            2 => Ok(CellKind::TableGenerationInfo),
            3 => Ok(CellKind::Data),
            4 => Ok(CellKind::TableCompleted),
            42 => Ok(CellKind::Noop),
            other => Err(DgateError::UnknownCellKind(other)),
        }
    }
}

/// One control cell of the ring.
///
/// 64 bytes, padded to a cache line. The producer writes these from the JVM
/// side; field order and widths must not change.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RingBufferCell {
    /// Raw cell tag; decode with [`RingBufferCell::kind`].
    pub cell_type: u32,

    /// Byte offset of the referenced data slot, relative to the data pool
    /// base.
    pub data_buffer_offset: u32,

    /// Id of the table the cell belongs to.
    pub table_id: u32,

    /// Alignment filler so `sorting_id` sits at offset 16.
    pub pad: u32,

    /// Absolute work-unit index within the table.
    pub sorting_id: i64,

    /// Total row count of the table, as known to the producer.
    pub table_num_rows: i64,

    /// Filler up to the cache-line size.
    pub padding: [u32; 8],
}

const _: () = assert!(std::mem::size_of::<RingBufferCell>() == 64);
const _: () = assert!(std::mem::align_of::<RingBufferCell>() == 8);

impl RingBufferCell {
    /// Decodes the cell tag, rejecting values outside the protocol.
    pub fn kind(&self) -> Result<CellKind> {
        CellKind::try_from(self.cell_type)
    }

    /// Rewrites this cell as a NOOP returning `data_buffer_offset` to the
    /// producer. Other fields are left untouched; the producer only reads
    /// the tag and the offset out of a NOOP.
    pub fn write_noop(&mut self, data_buffer_offset: u32) {
        self.cell_type = CellKind::Noop as u32;
        self.data_buffer_offset = data_buffer_offset;
    }
}

/// Geometry of the shared-memory region.
///
/// The defaults match the generator build (work units of 128 rows, 16
/// columns, 192-byte fields, 2²³ field slots, data pool at 2²⁸). Tests use
/// much smaller geometries; producer and consumer must agree on the values.
#[derive(Debug, Clone)]
pub struct ShmLayout {
    /// Rows per data cell (W).
    pub work_unit_size: u32,

    /// Maximum generated columns per data cell (K).
    pub column_count: u32,

    /// Byte width of a single field slot (F).
    pub field_size: u32,

    /// Total number of field slots in the data pool; the ring capacity is
    /// derived from it.
    pub field_slot_budget: u32,

    /// Byte offset at which the data pool starts. The ring of control cells
    /// must fit below it.
    pub data_pool_offset: usize,
}

impl Default for ShmLayout {
    fn default() -> Self {
        Self {
            work_unit_size: super::DEFAULT_WORK_UNIT_SIZE,
            column_count: super::DEFAULT_COLUMN_COUNT,
            field_size: super::DEFAULT_FIELD_SIZE,
            field_slot_budget: super::DEFAULT_FIELD_SLOT_BUDGET,
            data_pool_offset: super::DEFAULT_DATA_POOL_OFFSET,
        }
    }
}

impl ShmLayout {
    /// Number of control cells in the ring (R), one per data slot.
    pub fn ring_capacity(&self) -> u32 {
        self.field_slot_budget / (self.work_unit_size * self.column_count)
    }

    /// Byte size of one data slot (W·K·F).
    pub fn data_slot_bytes(&self) -> usize {
        self.work_unit_size as usize * self.column_count as usize * self.field_size as usize
    }

    /// Byte size of the ring of control cells.
    pub fn ring_bytes(&self) -> usize {
        self.ring_capacity() as usize * std::mem::size_of::<RingBufferCell>()
    }

    /// Byte size of the data pool.
    pub fn data_pool_bytes(&self) -> usize {
        self.ring_capacity() as usize * self.data_slot_bytes()
    }

    /// Total size the shared-memory object must be truncated to.
    pub fn total_bytes(&self) -> usize {
        self.data_pool_offset + self.data_pool_bytes()
    }

    /// Checks that the geometry is usable before any OS resource is created.
    pub fn validate(&self) -> Result<()> {
        if self.work_unit_size < 2 {
            return Err(DgateError::InvalidLayout(format!(
                "work unit size must be at least 2, got {}",
                self.work_unit_size
            )));
        }
        if self.column_count < 1 {
            return Err(DgateError::InvalidLayout("column count must be at least 1".into()));
        }
        if self.field_size < 8 {
            return Err(DgateError::InvalidLayout(format!(
                "field size must hold a 64-bit value, got {}",
                self.field_size
            )));
        }
        let slot_fields = self.work_unit_size * self.column_count;
        if self.field_slot_budget < slot_fields || self.field_slot_budget % slot_fields != 0 {
            return Err(DgateError::InvalidLayout(format!(
                "field slot budget {} does not divide into {}-field data slots",
                self.field_slot_budget, slot_fields
            )));
        }
        if self.ring_bytes() > self.data_pool_offset {
            return Err(DgateError::InvalidLayout(format!(
                "{} ring cells need {} bytes but the data pool starts at {}",
                self.ring_capacity(),
                self.ring_bytes(),
                self.data_pool_offset
            )));
        }
        Ok(())
    }

    /// Resolves a cell's data-slot offset to a slot index, rejecting
    /// offsets that are unaligned or outside the pool.
    pub fn slot_index(&self, data_buffer_offset: u32) -> Result<usize> {
        let slot_bytes = self.data_slot_bytes();
        let offset = data_buffer_offset as usize;
        if offset % slot_bytes != 0 || offset / slot_bytes >= self.ring_capacity() as usize {
            return Err(DgateError::BadSlotOffset {
                offset: data_buffer_offset,
            });
        }
        Ok(offset / slot_bytes)
    }
}

/// Read-only view of one data slot as a sequence of fixed-size field slots.
///
/// Data cells address fields two-dimensionally as `(row, column)`; the
/// schema and generation-info payloads run through the same slots as a flat
/// sequence. Both addressings share the flat indexing `row · K + column`.
pub struct DataCellView<'a> {
    bytes: &'a [u8],
    column_count: u32,
    field_size: u32,
}

impl<'a> DataCellView<'a> {
    /// Wraps a slot's bytes. The field capacity is derived from the length
    /// of `bytes`.
    pub fn new(bytes: &'a [u8], column_count: u32, field_size: u32) -> Self {
        Self {
            bytes,
            column_count,
            field_size,
        }
    }

    /// Number of whole field slots in the view.
    pub fn field_capacity(&self) -> u32 {
        (self.bytes.len() / self.field_size as usize) as u32
    }

    /// The raw bytes of the field at flat position `index`.
    pub fn field(&self, index: u32) -> Result<&'a [u8]> {
        if index >= self.field_capacity() {
            return Err(DgateError::PayloadOutOfBounds {
                index,
                capacity: self.field_capacity(),
            });
        }
        let start = index as usize * self.field_size as usize;
        Ok(&self.bytes[start..start + self.field_size as usize])
    }

    /// The raw bytes of the field for row `row`, generated column `column`.
    pub fn data_field(&self, row: u32, column: u32) -> Result<&'a [u8]> {
        self.field(row * self.column_count + column)
    }

    /// Reads a little-endian `u32` from the start of a field slot.
    pub fn read_u32(&self, index: u32) -> Result<u32> {
        Ok(bytemuck::pod_read_unaligned(&self.field(index)?[..4]))
    }

    /// Reads a little-endian `i64` from the start of a field slot.
    pub fn read_i64(&self, index: u32) -> Result<i64> {
        Ok(bytemuck::pod_read_unaligned(&self.field(index)?[..8]))
    }

    /// Reads a boolean encoded as a 32-bit integer.
    pub fn read_bool(&self, index: u32) -> Result<bool> {
        Ok(self.read_u32(index)? != 0)
    }

    /// Reads a NUL-terminated UTF-8 string from a field slot.
    pub fn read_string(&self, index: u32) -> Result<String> {
        Ok(decode_string_field(self.field(index)?))
    }
}

/// Decodes a NUL-terminated UTF-8 string from an F-byte field slot.
///
/// The producer is trusted to terminate every string inside the slot; a
/// slot without a terminator is truncated at the field boundary and logged,
/// never overrun.
pub fn decode_string_field(field: &[u8]) -> String {
    let bytes = match field.iter().position(|&b| b == 0) {
        Some(nul) => &field[..nul],
        None => {
            tracing::warn!(field_size = field.len(), "string field without terminator, truncating");
            field
        }
    };
    String::from_utf8_lossy(bytes).into_owned()
}

/// Writes a string into an F-byte field slot, NUL-terminated and
/// NUL-padded, for producer-side test and example code.
pub fn write_string_field(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(field.len().saturating_sub(1));
    field[..len].copy_from_slice(&bytes[..len]);
    field[len..].fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_layout_is_stable() {
        assert_eq!(std::mem::size_of::<RingBufferCell>(), 64);

        // Field offsets as the producer writes them.
        let cell = RingBufferCell {
            cell_type: 3,
            data_buffer_offset: 0x100,
            table_id: 7,
            pad: 0,
            sorting_id: -1,
            table_num_rows: 1 << 40,
            padding: [0; 8],
        };
        let bytes = bytemuck::bytes_of(&cell);
        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0x100u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &7u32.to_le_bytes());
        assert_eq!(&bytes[16..24], &(-1i64).to_le_bytes());
        assert_eq!(&bytes[24..32], &(1i64 << 40).to_le_bytes());
    }

    #[test]
    fn cell_kinds_round_trip() {
        for kind in [
            CellKind::TableSchema,
            CellKind::TableGenerationInfo,
            CellKind::Data,
            CellKind::TableCompleted,
            CellKind::Noop,
        ] {
            assert_eq!(CellKind::try_from(kind as u32).unwrap(), kind);
        }
        assert!(matches!(
            CellKind::try_from(5),
            Err(DgateError::UnknownCellKind(5))
        ));
    }

    #[test]
    fn default_layout_matches_the_producer_build() {
        let layout = ShmLayout::default();
        layout.validate().unwrap();
        assert_eq!(layout.ring_capacity(), 4096);
        assert_eq!(layout.data_slot_bytes(), 128 * 16 * 192);
        assert_eq!(layout.data_pool_offset, 1 << 28);
        assert_eq!(
            layout.total_bytes(),
            (1 << 28) + 4096 * 128 * 16 * 192
        );
    }

    #[test]
    fn layout_validation_rejects_bad_geometry() {
        let mut layout = ShmLayout {
            work_unit_size: 1,
            ..ShmLayout::default()
        };
        assert!(layout.validate().is_err());

        layout.work_unit_size = 128;
        layout.field_size = 4;
        assert!(layout.validate().is_err());

        // Ring too large for the gap before the data pool.
        let layout = ShmLayout {
            work_unit_size: 2,
            column_count: 1,
            field_size: 8,
            field_slot_budget: 1 << 20,
            data_pool_offset: 4096,
        };
        assert!(layout.validate().is_err());
    }

    #[test]
    fn slot_offsets_resolve_to_indices() {
        let layout = ShmLayout {
            work_unit_size: 2,
            column_count: 2,
            field_size: 32,
            field_slot_budget: 16,
            data_pool_offset: 4096,
        };
        layout.validate().unwrap();
        assert_eq!(layout.ring_capacity(), 4);
        assert_eq!(layout.data_slot_bytes(), 128);

        assert_eq!(layout.slot_index(0).unwrap(), 0);
        assert_eq!(layout.slot_index(384).unwrap(), 3);
        assert!(layout.slot_index(64).is_err());
        assert!(layout.slot_index(512).is_err());
    }

    #[test]
    fn view_addresses_rows_and_columns() {
        let field_size = 32u32;
        let mut bytes = vec![0u8; 2 * 2 * field_size as usize];
        bytes[(2 + 1) * 32] = 0xAA; // row 1, column 1
        let view = DataCellView::new(&bytes, 2, field_size);

        assert_eq!(view.field_capacity(), 4);
        assert_eq!(view.data_field(1, 1).unwrap()[0], 0xAA);
        assert!(view.field(4).is_err());
    }

    #[test]
    fn typed_reads_decode_little_endian() {
        let mut bytes = vec![0u8; 4 * 32];
        bytes[0..4].copy_from_slice(&17u32.to_le_bytes());
        bytes[32..40].copy_from_slice(&(-9i64).to_le_bytes());
        write_string_field(&mut bytes[64..96], "lineitem");

        let view = DataCellView::new(&bytes, 2, 32);
        assert_eq!(view.read_u32(0).unwrap(), 17);
        assert_eq!(view.read_i64(1).unwrap(), -9);
        assert_eq!(view.read_string(2).unwrap(), "lineitem");
        assert!(!view.read_bool(3).unwrap());
    }

    #[test]
    fn unterminated_strings_are_truncated_at_the_field() {
        let bytes = vec![b'x'; 32];
        let view = DataCellView::new(&bytes, 1, 32);
        assert_eq!(view.read_string(0).unwrap(), "x".repeat(32));
    }
}
