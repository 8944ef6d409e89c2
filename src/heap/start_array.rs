use std::sync::atomic::{AtomicU8, Ordering};

use crate::base::{constants::LOG_BYTES_PER_WORD, memory_region::MemoryRegion};

use super::object_model::ObjectModel;

pub const CARD_SHIFT: usize = 9;
pub const CARD_SIZE: usize = 1 << CARD_SHIFT;
pub const CARD_WORDS: usize = CARD_SIZE >> LOG_BYTES_PER_WORD;

const CLEAN: u8 = u8::MAX;

/// Per-space table of object starts at card granularity.
///
/// Each entry holds the word offset of the first recorded object starting in its card, or
/// [`CLEAN`] if none was recorded. Entries only shrink within a cycle, so concurrent
/// recorders of the same card agree on the final value.
pub struct ObjectStartArray {
    covered: MemoryRegion,
    entries: Box<[AtomicU8]>,
}

impl ObjectStartArray {
    pub fn new(covered: MemoryRegion) -> Self {
        let cards = (covered.size() + CARD_SIZE - 1) >> CARD_SHIFT;
        Self {
            covered,
            entries: (0..cards).map(|_| AtomicU8::new(CLEAN)).collect(),
        }
    }

    pub fn covered(&self) -> MemoryRegion {
        self.covered
    }

    pub fn reset(&self) {
        for entry in self.entries.iter() {
            entry.store(CLEAN, Ordering::Relaxed);
        }
    }

    #[inline]
    fn card_index(&self, addr: usize) -> usize {
        assert!(
            self.covered.contains(addr),
            "address 0x{:x} outside of start array {:?}",
            addr,
            self.covered
        );
        (addr - self.covered.start()) >> CARD_SHIFT
    }

    #[inline]
    fn card_start(&self, index: usize) -> usize {
        self.covered.start() + (index << CARD_SHIFT)
    }

    /// Records that an object starts at `addr`.
    pub fn allocate_block(&self, addr: usize) {
        let index = self.card_index(addr);
        let offset = (addr - self.card_start(index)) >> LOG_BYTES_PER_WORD;
        // First object wins.
        self.entries[index].fetch_min(offset as u8, Ordering::Relaxed);
    }

    fn recorded_start(&self, index: usize) -> Option<usize> {
        match self.entries[index].load(Ordering::Relaxed) {
            CLEAN => None,
            offset => Some(self.card_start(index) + ((offset as usize) << LOG_BYTES_PER_WORD)),
        }
    }

    /// True if any object start was recorded in the card holding `addr`.
    pub fn is_block_allocated(&self, addr: usize) -> bool {
        self.recorded_start(self.card_index(addr)).is_some()
    }

    /// Start of the object containing `addr`.
    ///
    /// # Safety
    ///
    /// The space must be parsable from the recorded starts (or from the bottom of the
    /// covered range if none precedes `addr`) up to `addr`.
    pub unsafe fn object_start<M: ObjectModel + ?Sized>(&self, addr: usize, model: &M) -> usize {
        let mut index = self.card_index(addr);
        let mut start = loop {
            match self.recorded_start(index) {
                Some(start) if start <= addr => break start,
                _ if index == 0 => break self.covered.start(),
                _ => index -= 1,
            }
        };

        loop {
            let next = start + (model.object_size(start) << LOG_BYTES_PER_WORD);
            if next > addr {
                return start;
            }
            start = next;
        }
    }
}
