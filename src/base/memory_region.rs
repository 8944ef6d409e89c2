use std::fmt;

use super::constants::LOG_BYTES_PER_WORD;

/// Half-open address range `[start, start + size)`.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryRegion {
    start: usize,
    size: usize,
}

impl MemoryRegion {
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    pub const fn from_bounds(start: usize, end: usize) -> Self {
        Self {
            start,
            size: end - start,
        }
    }

    pub const fn start(&self) -> usize {
        self.start
    }

    pub const fn end(&self) -> usize {
        self.start + self.size
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn word_size(&self) -> usize {
        self.size >> LOG_BYTES_PER_WORD
    }

    pub fn pointer(&self) -> *mut u8 {
        self.start as *mut u8
    }

    pub const fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.end()
    }

    pub const fn contains_region(&self, other: &MemoryRegion) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:x}, 0x{:x})", self.start, self.end())
    }
}
