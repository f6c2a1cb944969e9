//! Ownership of the POSIX shared-memory object.
//!
//! The reader side creates, sizes and maps the region; the external
//! generator only attaches to it. Any object left behind by a crashed prior
//! run is unlinked before creation, so stale state never leaks into a new
//! stream.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::FromRawFd;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{DgateError, Result};
use crate::shm::layout::{RingBufferCell, ShmLayout};

/// A mapped POSIX shared-memory object holding the control-cell ring and
/// the data-slot pool.
///
/// The region is unlinked again when this handle drops, on every exit path.
pub struct SharedMemoryRegion {
    name: CString,
    base: *mut u8,
    layout: ShmLayout,
    owner: bool,
    _mmap: MmapMut,
    _file: File,
}

// Safety: the mapping lives as long as `_mmap`, and all access to the shared
// areas is coordinated by the cross-process semaphore protocol; the raw base
// pointer itself carries no thread affinity.
unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

impl SharedMemoryRegion {
    /// Creates the shared-memory object under `name`, sizes it for `layout`
    /// and maps it.
    ///
    /// An existing object of the same name is unlinked first so the region
    /// always starts from a fresh state.
    pub fn create(name: &str, layout: ShmLayout) -> Result<Self> {
        layout.validate()?;

        let c_name = CString::new(name)
            .map_err(|_| DgateError::InvalidLayout(format!("shared memory name {name:?} contains NUL")))?;

        // Stale instances from crashed runs are discarded; a missing object
        // is not an error here.
        unsafe { libc::shm_unlink(c_name.as_ptr()) };

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666) };
        if fd < 0 {
            return Err(DgateError::last_os_error("shm_open"));
        }
        let file = unsafe { File::from_raw_fd(fd) };

        let total = layout.total_bytes();
        if unsafe { libc::ftruncate(fd, total as libc::off_t) } != 0 {
            let err = DgateError::last_os_error("ftruncate");
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(err);
        }

        let mut mmap = match unsafe { MmapOptions::new().len(total).map_mut(&file) } {
            Ok(mmap) => mmap,
            Err(source) => {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(DgateError::Resource { op: "mmap", source });
            }
        };
        let base = mmap.as_mut_ptr();

        tracing::info!(
            name,
            bytes = total,
            ring_capacity = layout.ring_capacity(),
            slot_bytes = layout.data_slot_bytes(),
            "created shared memory region"
        );

        Ok(Self {
            name: c_name,
            base,
            layout,
            owner: true,
            _mmap: mmap,
            _file: file,
        })
    }

    /// Attaches to a region another process created, as the producing side
    /// does. The object is neither sized nor unlinked by this handle.
    pub fn attach(name: &str, layout: ShmLayout) -> Result<Self> {
        layout.validate()?;

        let c_name = CString::new(name)
            .map_err(|_| DgateError::InvalidLayout(format!("shared memory name {name:?} contains NUL")))?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o666) };
        if fd < 0 {
            return Err(DgateError::last_os_error("shm_open"));
        }
        let file = unsafe { File::from_raw_fd(fd) };

        let mut mmap = unsafe { MmapOptions::new().len(layout.total_bytes()).map_mut(&file) }
            .map_err(|source| DgateError::Resource { op: "mmap", source })?;
        let base = mmap.as_mut_ptr();

        Ok(Self {
            name: c_name,
            base,
            layout,
            owner: false,
            _mmap: mmap,
            _file: file,
        })
    }

    /// The geometry this region was sized for.
    pub fn layout(&self) -> &ShmLayout {
        &self.layout
    }

    /// Base of the control-cell ring at offset 0.
    ///
    /// The pointer stays valid for the lifetime of the region; access is
    /// serialized by the ring coordinator.
    pub(crate) fn cells_ptr(&self) -> *mut RingBufferCell {
        self.base as *mut RingBufferCell
    }

    /// The bytes of the data slot a control cell referenced.
    pub fn data_slot(&self, data_buffer_offset: u32) -> Result<&[u8]> {
        let index = self.layout.slot_index(data_buffer_offset)?;
        let slot_bytes = self.layout.data_slot_bytes();
        let start = self.layout.data_pool_offset + index * slot_bytes;
        // Safety: `slot_index` bounds-checked the offset against the pool,
        // which lies entirely inside the mapping.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(start), slot_bytes) })
    }

    /// Mutable access to a data slot, for the producing side of the
    /// protocol (in-process mock producers in tests and examples).
    ///
    /// # Safety
    ///
    /// The caller must own the slot under the semaphore protocol: no other
    /// side may read or write it until ownership is handed over through the
    /// ring.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_slot_mut(&self, data_buffer_offset: u32) -> Result<&mut [u8]> {
        let index = self.layout.slot_index(data_buffer_offset)?;
        let slot_bytes = self.layout.data_slot_bytes();
        let start = self.layout.data_pool_offset + index * slot_bytes;
        Ok(std::slice::from_raw_parts_mut(self.base.add(start), slot_bytes))
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        if self.owner {
            tracing::debug!(name = ?self.name, "unlinking shared memory region");
            unsafe { libc::shm_unlink(self.name.as_ptr()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_layout() -> ShmLayout {
        ShmLayout {
            work_unit_size: 2,
            column_count: 2,
            field_size: 32,
            field_slot_budget: 16,
            data_pool_offset: 4096,
        }
    }

    fn unique_name(tag: &str) -> String {
        format!("/dgate_test_{}_{}", tag, std::process::id())
    }

    #[test]
    fn create_write_and_read_back() {
        let name = unique_name("region_rw");
        let region = SharedMemoryRegion::create(&name, test_layout()).unwrap();

        let slot_bytes = region.layout().data_slot_bytes() as u32;
        unsafe {
            region.data_slot_mut(slot_bytes).unwrap()[0] = 0x5A;
        }
        assert_eq!(region.data_slot(slot_bytes).unwrap()[0], 0x5A);
        assert_eq!(region.data_slot(0).unwrap()[0], 0);

        assert!(region.data_slot(slot_bytes + 1).is_err());
    }

    #[test]
    fn cells_are_addressable() {
        let name = unique_name("region_cells");
        let region = SharedMemoryRegion::create(&name, test_layout()).unwrap();

        let cells = region.cells_ptr();
        unsafe {
            (*cells.add(3)).cell_type = 42;
            (*cells.add(3)).data_buffer_offset = 384;
            assert_eq!((*cells.add(3)).cell_type, 42);
            assert_eq!((*cells.add(3)).data_buffer_offset, 384);
        }
    }

    #[test]
    fn drop_unlinks_the_object() {
        let name = unique_name("region_unlink");
        let shm_path = format!("/dev/shm{name}");

        let region = SharedMemoryRegion::create(&name, test_layout()).unwrap();
        assert!(std::path::Path::new(&shm_path).exists());

        drop(region);
        assert!(!std::path::Path::new(&shm_path).exists());
    }

    #[test]
    fn attached_handle_shares_the_bytes_without_owning_them() {
        let name = unique_name("region_attach");
        let shm_path = format!("/dev/shm{name}");

        let creator = SharedMemoryRegion::create(&name, test_layout()).unwrap();
        unsafe {
            creator.data_slot_mut(0).unwrap()[5] = 9;
        }

        let attached = SharedMemoryRegion::attach(&name, test_layout()).unwrap();
        assert_eq!(attached.data_slot(0).unwrap()[5], 9);

        drop(attached);
        assert!(std::path::Path::new(&shm_path).exists());
    }

    #[test]
    fn create_discards_a_stale_instance() {
        let name = unique_name("region_stale");
        let first = SharedMemoryRegion::create(&name, test_layout()).unwrap();
        unsafe {
            first.data_slot_mut(0).unwrap()[0] = 0xFF;
        }

        // Simulate a crashed prior run leaving the object behind.
        std::mem::forget(first);

        let second = SharedMemoryRegion::create(&name, test_layout()).unwrap();
        assert_eq!(second.data_slot(0).unwrap()[0], 0);
    }
}
