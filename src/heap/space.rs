use std::fmt;

use crate::{
    base::{memory_region::MemoryRegion, utils::pointer_delta},
    formatted_size,
};

use super::{arguments::SpaceConfig, start_array::ObjectStartArray};

/// Collector-side state of one compactable space.
pub struct SpaceInfo {
    name: &'static str,
    bottom: usize,
    end: usize,
    top: usize,
    /// End of live data once compaction finishes.
    new_top: usize,
    /// Objects below this address stay where they are.
    dense_prefix: usize,
    dead_ratio: usize,
    start_array: ObjectStartArray,
    pub(crate) live_words: usize,
    pub(crate) live_objects: usize,
}

impl SpaceInfo {
    pub fn new(config: &SpaceConfig) -> Self {
        Self {
            name: config.name,
            bottom: config.bottom,
            end: config.end,
            top: config.top,
            new_top: config.top,
            dense_prefix: config.bottom,
            dead_ratio: config.dead_ratio,
            start_array: ObjectStartArray::new(MemoryRegion::from_bounds(config.bottom, config.end)),
            live_words: 0,
            live_objects: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bottom(&self) -> usize {
        self.bottom
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn top(&self) -> usize {
        self.top
    }

    pub fn set_top(&mut self, top: usize) {
        assert!(
            top >= self.bottom && top <= self.end,
            "top 0x{:x} outside of space {}",
            top,
            self.name
        );
        self.top = top;
    }

    pub fn new_top(&self) -> usize {
        self.new_top
    }

    pub fn set_new_top(&mut self, new_top: usize) {
        debug_assert!(new_top >= self.bottom && new_top <= self.top);
        self.new_top = new_top;
    }

    pub fn dense_prefix(&self) -> usize {
        self.dense_prefix
    }

    pub fn set_dense_prefix(&mut self, addr: usize) {
        debug_assert!(addr >= self.bottom && addr <= self.end);
        self.dense_prefix = addr;
    }

    pub fn dead_ratio(&self) -> usize {
        self.dead_ratio
    }

    pub fn start_array(&self) -> &ObjectStartArray {
        &self.start_array
    }

    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::from_bounds(self.bottom, self.end)
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom && addr < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.top == self.bottom
    }

    pub fn used_in_words(&self) -> usize {
        pointer_delta(self.top, self.bottom)
    }

    pub fn capacity_in_words(&self) -> usize {
        pointer_delta(self.end, self.bottom)
    }
}

impl fmt::Debug for SpaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpaceInfo")
            .field("name", &self.name)
            .field("bottom", &format_args!("0x{:x}", self.bottom))
            .field("top", &format_args!("0x{:x}", self.top))
            .field("new_top", &format_args!("0x{:x}", self.new_top))
            .field("dense_prefix", &format_args!("0x{:x}", self.dense_prefix))
            .field("capacity", &formatted_size(self.end - self.bottom))
            .finish()
    }
}
