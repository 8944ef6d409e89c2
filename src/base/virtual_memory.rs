use once_cell::sync::Lazy;

use super::{memory_region::MemoryRegion, utils::log2};

/// Anonymous, zero-filled mapping owned by the collector.
///
/// Backs the mark bitmaps and the region/block tables, and in tests the heap itself.
/// The mapping is released when the value is dropped.
pub struct VirtualMemory {
    region: MemoryRegion,
    reserved: MemoryRegion,
}

impl VirtualMemory {
    pub fn start(&self) -> usize {
        self.region.start()
    }

    pub fn end(&self) -> usize {
        self.region.end()
    }

    pub fn address(&self) -> *mut u8 {
        self.region.pointer()
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }

    pub fn region(&self) -> MemoryRegion {
        self.region
    }

    pub fn contains(&self, address: usize) -> bool {
        self.region.contains(address)
    }
}

#[cfg(unix)]
mod vm {
    use std::ptr::null_mut;

    use crate::base::{memory_region::MemoryRegion, utils::round_up};

    use super::{page_size, VirtualMemory};

    pub unsafe fn generic_map_aligned(
        prot: i32,
        size: usize,
        alignment: usize,
        allocated_size: usize,
        map_flags: i32,
    ) -> *mut u8 {
        let addr = libc::mmap(null_mut(), allocated_size, prot, map_flags, -1, 0);

        if addr == libc::MAP_FAILED {
            return null_mut();
        }

        let base = addr as usize;
        let aligned_base = round_up(base as _, alignment as _) as usize;

        unmap(base, aligned_base);
        unmap(aligned_base + size, base + allocated_size);
        aligned_base as _
    }

    pub unsafe fn unmap(start: usize, end: usize) {
        let size = end - start;
        if size == 0 {
            return;
        }

        if libc::munmap(start as _, size) != 0 {
            panic!("munmap(0x{:x}, 0x{:x}) failed", start, size);
        }
    }

    impl VirtualMemory {
        /// Maps `size` bytes of zeroed read-write memory aligned to `alignment`.
        ///
        /// Returns `None` when the OS refuses the mapping; `errno` is left untouched so the
        /// caller can report it.
        pub fn allocate_aligned(size: usize, alignment: usize, name: &'static str) -> Option<Box<Self>> {
            let alignment = alignment.max(page_size());
            let size = round_up(size.max(1) as _, page_size() as _) as usize;
            let allocated_size = size.checked_add(alignment - page_size())?;

            let address = unsafe {
                generic_map_aligned(
                    libc::PROT_READ | libc::PROT_WRITE,
                    size,
                    alignment,
                    allocated_size,
                    libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                )
            };

            if address.is_null() {
                return None;
            }

            log::trace!(target: "gc", "mapped {} at {:p} ({} bytes)", name, address, size);
            let region = MemoryRegion::new(address as usize, size);

            Some(Box::new(VirtualMemory {
                region,
                reserved: region,
            }))
        }
    }

    impl Drop for VirtualMemory {
        fn drop(&mut self) {
            unsafe {
                unmap(self.reserved.start(), self.reserved.end());
            }
        }
    }
}

static PAGE_SIZE: Lazy<usize> = Lazy::new(determine_page_size);

pub fn page_size() -> usize {
    *PAGE_SIZE
}

pub fn page_size_bits() -> usize {
    log2(page_size())
}

#[cfg(unix)]
fn determine_page_size() -> usize {
    let val = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if val <= 0 {
        panic!("could not determine page size.");
    }

    let val = val as usize;
    assert!(val.is_power_of_two());
    val
}
