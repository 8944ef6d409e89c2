use std::sync::atomic::{AtomicUsize, Ordering};

use crate::base::{
    constants::{BITS_PER_WORD, BYTES_PER_WORD, LOG_BITS_PER_WORD, LOG_BYTES_PER_WORD},
    memory_region::MemoryRegion,
    virtual_memory::{page_size, VirtualMemory},
};

use super::error::CollectorError;

/// Outcome of walking live objects with a [`ParMarkBitmapClosure`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IterationStatus {
    /// The closure wants more objects, or the last object extends past the range.
    Incomplete,
    /// Every object in the range was processed.
    Complete,
    /// The closure's destination is exactly full.
    Full,
    /// The current object does not fit in what remains of the destination.
    WouldOverflow,
}

pub trait ParMarkBitmapClosure {
    fn do_addr(&mut self, addr: usize, words: usize) -> IterationStatus;

    /// Records where iteration stopped; iteration resumes from here.
    fn set_source(&mut self, addr: usize);
}

/// Word-array view over a plain bitmap stored in collector-owned memory.
struct BitMapView {
    map: usize,
    size: usize,
}

impl BitMapView {
    #[inline(always)]
    const fn bit_mask(bit: usize) -> usize {
        1 << Self::bit_in_word(bit)
    }

    #[inline(always)]
    const fn bit_in_word(bit: usize) -> usize {
        bit & (BITS_PER_WORD - 1)
    }

    #[inline(always)]
    const fn word_index(bit: usize) -> usize {
        bit >> LOG_BITS_PER_WORD
    }

    #[inline(always)]
    fn word(&self, index: usize) -> &AtomicUsize {
        unsafe { &*(self.map as *const AtomicUsize).add(index) }
    }

    fn words(&self) -> usize {
        (self.size + BITS_PER_WORD - 1) >> LOG_BITS_PER_WORD
    }

    fn verify_index(&self, index: usize) {
        assert!(
            index < self.size,
            "BitMap index is out of bounds: {} >= {}",
            index,
            self.size
        )
    }

    fn verify_range(&self, start: usize, end: usize) {
        assert!(start <= end, "BitMap range is invalid: {} > {}", start, end);
        assert!(
            end <= self.size,
            "BitMap limit is out of bounds: {} > {}",
            end,
            self.size
        )
    }

    #[inline]
    fn at(&self, bit: usize) -> bool {
        self.verify_index(bit);
        self.word(Self::word_index(bit)).load(Ordering::Relaxed) & Self::bit_mask(bit) != 0
    }

    /// Sets `bit`, returning true if this call changed it.
    #[inline]
    fn par_set_bit(&self, bit: usize) -> bool {
        self.verify_index(bit);
        let word = self.word(Self::word_index(bit));
        let mask = Self::bit_mask(bit);
        let mut old_val = word.load(Ordering::Relaxed);

        loop {
            let new_val = old_val | mask;
            if new_val == old_val {
                return false;
            }

            match word.compare_exchange_weak(old_val, new_val, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(val) => old_val = val,
            }
        }
    }

    /// First set bit in `[beg, end)`, or `end`.
    fn find_next_one(&self, beg: usize, end: usize) -> usize {
        self.verify_range(beg, end);
        if beg >= end {
            return end;
        }

        let limit = Self::word_index(end + BITS_PER_WORD - 1);
        let mut index = Self::word_index(beg);
        let mut word = self.word(index).load(Ordering::Relaxed) & (!0usize << Self::bit_in_word(beg));

        loop {
            if word != 0 {
                let bit = (index << LOG_BITS_PER_WORD) + word.trailing_zeros() as usize;
                return bit.min(end);
            }

            index += 1;
            if index >= limit {
                return end;
            }
            word = self.word(index).load(Ordering::Relaxed);
        }
    }

    /// Last set bit in `[limit, end)`.
    fn find_prev_one(&self, limit: usize, end: usize) -> Option<usize> {
        self.verify_range(limit, end);
        if end <= limit {
            return None;
        }

        let last = end - 1;
        let in_word = Self::bit_in_word(last);
        let mask = if in_word == BITS_PER_WORD - 1 {
            !0usize
        } else {
            (1usize << (in_word + 1)) - 1
        };
        let limit_index = Self::word_index(limit);
        let mut index = Self::word_index(last);
        let mut word = self.word(index).load(Ordering::Relaxed) & mask;

        loop {
            if word != 0 {
                let bit = (index << LOG_BITS_PER_WORD) + (BITS_PER_WORD - 1 - word.leading_zeros() as usize);
                return if bit >= limit { Some(bit) } else { None };
            }

            if index == limit_index {
                return None;
            }
            index -= 1;
            word = self.word(index).load(Ordering::Relaxed);
        }
    }

    fn clear_range(&self, beg: usize, end: usize) {
        self.verify_range(beg, end);
        if beg >= end {
            return;
        }

        let beg_index = Self::word_index(beg);
        let last_index = Self::word_index(end - 1);

        if beg_index == last_index {
            let width = end - beg;
            let mask = if width == BITS_PER_WORD {
                !0usize
            } else {
                ((1usize << width) - 1) << Self::bit_in_word(beg)
            };
            self.word(beg_index).fetch_and(!mask, Ordering::Relaxed);
            return;
        }

        self.word(beg_index)
            .fetch_and(!(!0usize << Self::bit_in_word(beg)), Ordering::Relaxed);
        for index in beg_index + 1..last_index {
            self.word(index).store(0, Ordering::Relaxed);
        }
        let tail = Self::bit_in_word(end - 1);
        let tail_mask = if tail == BITS_PER_WORD - 1 {
            !0usize
        } else {
            (1usize << (tail + 1)) - 1
        };
        self.word(last_index).fetch_and(!tail_mask, Ordering::Relaxed);
    }
}

/// Mark bitmap with one bit per heap word, kept as two parallel bitmaps: `beg_bits` has a
/// bit set for the first word of every live object and `end_bits` for its last word.
///
/// Both bitmaps live in a single anonymous mapping. The bitmap is populated by marking,
/// read-only during compaction and cleared before the next cycle.
pub struct ParMarkBitmap {
    covered: MemoryRegion,
    beg_bits: BitMapView,
    end_bits: BitMapView,
    _storage: Box<VirtualMemory>,
}

impl ParMarkBitmap {
    pub fn new(covered: MemoryRegion) -> Result<Self, CollectorError> {
        let bits = covered.word_size();
        let words_per_map = (bits + BITS_PER_WORD - 1) >> LOG_BITS_PER_WORD;
        let bytes = words_per_map * BYTES_PER_WORD * 2;

        let storage = VirtualMemory::allocate_aligned(bytes, page_size(), "mark bitmap")
            .ok_or_else(|| CollectorError::reservation("mark bitmap", bytes))?;

        let beg_bits = BitMapView {
            map: storage.start(),
            size: bits,
        };
        let end_bits = BitMapView {
            map: storage.start() + words_per_map * BYTES_PER_WORD,
            size: bits,
        };
        debug_assert!(beg_bits.words() == words_per_map && end_bits.words() == words_per_map);

        Ok(Self {
            covered,
            beg_bits,
            end_bits,
            _storage: storage,
        })
    }

    pub fn covered(&self) -> MemoryRegion {
        self.covered
    }

    /// Number of bits in each of the two bitmaps.
    pub fn size(&self) -> usize {
        self.beg_bits.size
    }

    #[inline]
    pub fn addr_to_bit(&self, addr: usize) -> usize {
        assert!(
            addr >= self.covered.start() && addr <= self.covered.end(),
            "address 0x{:x} outside of covered range {:?}",
            addr,
            self.covered
        );
        (addr - self.covered.start()) >> LOG_BYTES_PER_WORD
    }

    #[inline]
    pub fn bit_to_addr(&self, bit: usize) -> usize {
        debug_assert!(bit <= self.size());
        self.covered.start() + (bit << LOG_BYTES_PER_WORD)
    }

    /// Marks the object at `addr` spanning `size` words. Returns true if this call is the one
    /// that marked it.
    pub fn mark(&self, addr: usize, size: usize) -> bool {
        assert!(size > 0, "cannot mark a zero-sized object at 0x{:x}", addr);
        let beg_bit = self.addr_to_bit(addr);
        if self.beg_bits.par_set_bit(beg_bit) {
            let end_bit = beg_bit + size - 1;
            self.end_bits.par_set_bit(end_bit);
            return true;
        }

        false
    }

    #[inline]
    pub fn is_marked(&self, addr: usize) -> bool {
        self.beg_bits.at(self.addr_to_bit(addr))
    }

    #[inline]
    pub fn is_unmarked(&self, addr: usize) -> bool {
        !self.is_marked(addr)
    }

    #[inline]
    pub fn is_obj_start(&self, bit: usize) -> bool {
        self.beg_bits.at(bit)
    }

    #[inline]
    pub fn is_obj_end(&self, bit: usize) -> bool {
        self.end_bits.at(bit)
    }

    /// First object start bit in `[beg, end)`, or `end`.
    #[inline]
    pub fn find_obj_beg(&self, beg: usize, end: usize) -> usize {
        self.beg_bits.find_next_one(beg, end)
    }

    /// First object end bit in `[beg, end)`, or `end`.
    #[inline]
    pub fn find_obj_end(&self, beg: usize, end: usize) -> usize {
        self.end_bits.find_next_one(beg, end)
    }

    pub fn find_prev_obj_beg(&self, limit: usize, end: usize) -> Option<usize> {
        self.beg_bits.find_prev_one(limit, end)
    }

    pub fn find_prev_obj_end(&self, limit: usize, end: usize) -> Option<usize> {
        self.end_bits.find_prev_one(limit, end)
    }

    /// Address flavor of [`find_obj_beg`](Self::find_obj_beg).
    pub fn find_obj_beg_addr(&self, beg: usize, end: usize) -> usize {
        self.bit_to_addr(self.find_obj_beg(self.addr_to_bit(beg), self.addr_to_bit(end)))
    }

    /// Address of the last word of the object covering `beg`, searching below `end`.
    pub fn find_obj_end_addr(&self, beg: usize, end: usize) -> usize {
        self.bit_to_addr(self.find_obj_end(self.addr_to_bit(beg), self.addr_to_bit(end)))
    }

    #[inline]
    pub const fn obj_size(beg_bit: usize, end_bit: usize) -> usize {
        end_bit - beg_bit + 1
    }

    /// Size in words of the marked object starting at `addr`.
    pub fn obj_size_at(&self, addr: usize) -> usize {
        let beg = self.addr_to_bit(addr);
        debug_assert!(self.is_obj_start(beg), "no object starts at 0x{:x}", addr);
        let end = self.find_obj_end(beg, self.size());
        assert!(end < self.size(), "object at 0x{:x} has no end bit", addr);
        Self::obj_size(beg, end)
    }

    /// Live words in `[beg_addr, end_obj)` due to objects that start in the range.
    ///
    /// `end_obj` must be the start of a live object, so no counted object extends past it.
    pub fn live_words_in_range(&self, beg_addr: usize, end_obj: usize) -> usize {
        let end_bit = self.addr_to_bit(end_obj);
        let mut cur = self.find_obj_beg(self.addr_to_bit(beg_addr), end_bit);
        let mut live = 0;

        while cur < end_bit {
            let obj_end = self.find_obj_end(cur, end_bit);
            debug_assert!(obj_end < end_bit, "object crosses 0x{:x}", end_obj);
            live += Self::obj_size(cur, obj_end);
            cur = self.find_obj_beg(obj_end + 1, end_bit);
        }

        live
    }

    #[inline]
    fn search_end(&self, bit: usize) -> usize {
        ((bit + BITS_PER_WORD - 1) & !(BITS_PER_WORD - 1)).min(self.size())
    }

    /// Applies `live_closure` to each object starting in `[range_beg, range_end)` in address
    /// order. Stops early when the closure reports anything but `Incomplete`; returns
    /// `Incomplete` with the closure's source set to the object when the last object
    /// ends beyond `range_end`.
    pub fn iterate(
        &self,
        live_closure: &mut dyn ParMarkBitmapClosure,
        range_beg: usize,
        range_end: usize,
    ) -> IterationStatus {
        let range_beg = self.addr_to_bit(range_beg);
        let range_end = self.addr_to_bit(range_end);
        let search_end = self.search_end(range_end);

        let mut cur_beg = self.find_obj_beg(range_beg, search_end);
        while cur_beg < range_end {
            let cur_end = self.find_obj_end(cur_beg, search_end);
            if cur_end >= range_end {
                live_closure.set_source(self.bit_to_addr(cur_beg));
                return IterationStatus::Incomplete;
            }

            let size = Self::obj_size(cur_beg, cur_end);
            let status = live_closure.do_addr(self.bit_to_addr(cur_beg), size);
            if status != IterationStatus::Incomplete {
                debug_assert!(matches!(
                    status,
                    IterationStatus::WouldOverflow | IterationStatus::Full
                ));
                return status;
            }

            cur_beg = self.find_obj_beg(cur_end + 1, search_end);
        }

        live_closure.set_source(self.bit_to_addr(range_end));
        IterationStatus::Complete
    }

    /// Like [`iterate`](Self::iterate), additionally handing every dead gap to
    /// `dead_closure`. Dead space after the last object is reported up to
    /// `dead_range_end`.
    pub fn iterate_with_dead(
        &self,
        live_closure: &mut dyn ParMarkBitmapClosure,
        dead_closure: &mut dyn ParMarkBitmapClosure,
        range_beg: usize,
        range_end: usize,
        dead_range_end: usize,
    ) -> IterationStatus {
        let range_beg = self.addr_to_bit(range_beg);
        let range_end = self.addr_to_bit(range_end);
        let dead_range_end = self.addr_to_bit(dead_range_end);
        let live_search_end = self.search_end(range_end);
        let dead_search_end = self.search_end(dead_range_end);

        let mut cur_beg = range_beg;
        if range_beg < range_end && !self.is_obj_start(range_beg) {
            // The range starts with dead space.
            cur_beg = self.find_obj_beg(range_beg + 1, dead_search_end);
            let dead_space_end = cur_beg.min(dead_range_end) - 1;
            dead_closure.do_addr(
                self.bit_to_addr(range_beg),
                Self::obj_size(range_beg, dead_space_end),
            );
        }

        while cur_beg < range_end {
            let cur_end = self.find_obj_end(cur_beg, live_search_end);
            if cur_end >= range_end {
                live_closure.set_source(self.bit_to_addr(cur_beg));
                return IterationStatus::Incomplete;
            }

            let size = Self::obj_size(cur_beg, cur_end);
            let status = live_closure.do_addr(self.bit_to_addr(cur_beg), size);
            if status != IterationStatus::Incomplete {
                return status;
            }

            let dead_space_beg = cur_end + 1;
            if dead_space_beg >= dead_range_end {
                break;
            }

            cur_beg = self.find_obj_beg(dead_space_beg, dead_search_end);
            if cur_beg > dead_space_beg {
                let dead_space_end = cur_beg.min(dead_range_end) - 1;
                dead_closure.do_addr(
                    self.bit_to_addr(dead_space_beg),
                    Self::obj_size(dead_space_beg, dead_space_end),
                );
            }
        }

        live_closure.set_source(self.bit_to_addr(range_end));
        IterationStatus::Complete
    }

    /// Live objects starting in `[beg, end)` as `(address, words)` pairs, in address order.
    pub fn live_objects(&self, beg: usize, end: usize) -> LiveObjects<'_> {
        LiveObjects {
            bitmap: self,
            cur: self.addr_to_bit(beg),
            end: self.addr_to_bit(end),
        }
    }

    pub fn clear_range(&self, beg: usize, end: usize) {
        let beg = self.addr_to_bit(beg);
        let end = self.addr_to_bit(end);
        self.beg_bits.clear_range(beg, end);
        self.end_bits.clear_range(beg, end);
    }

    /// True if no bit is set in `[beg, end)`.
    pub fn is_clear_range(&self, beg: usize, end: usize) -> bool {
        let beg = self.addr_to_bit(beg);
        let end = self.addr_to_bit(end);
        self.beg_bits.find_next_one(beg, end) == end && self.end_bits.find_next_one(beg, end) == end
    }
}

/// Restartable walk over live objects; see [`ParMarkBitmap::live_objects`].
pub struct LiveObjects<'a> {
    bitmap: &'a ParMarkBitmap,
    cur: usize,
    end: usize,
}

impl LiveObjects<'_> {
    /// Address from which a fresh walk would continue this one.
    pub fn resume_point(&self) -> usize {
        self.bitmap.bit_to_addr(self.cur)
    }
}

impl Iterator for LiveObjects<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        if self.cur >= self.end {
            return None;
        }

        let beg = self.bitmap.find_obj_beg(self.cur, self.end);
        if beg >= self.end {
            self.cur = self.end;
            return None;
        }

        let end = self.bitmap.find_obj_end(beg, self.bitmap.size());
        assert!(
            end < self.bitmap.size(),
            "object at 0x{:x} has no end bit",
            self.bitmap.bit_to_addr(beg)
        );
        self.cur = end + 1;
        Some((self.bitmap.bit_to_addr(beg), ParMarkBitmap::obj_size(beg, end)))
    }
}
