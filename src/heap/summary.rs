use std::mem::size_of;

use crate::base::{
    constants::LOG_BYTES_PER_WORD,
    memory_region::MemoryRegion,
    utils::pointer_delta,
    virtual_memory::{page_size, VirtualMemory},
};

use super::{
    align_down, align_up,
    arguments::CompactOptions,
    error::CollectorError,
    mark_bitmap::ParMarkBitmap,
    region::{BlockData, RegionData},
};

/// Region and block side tables for the covered range.
///
/// Both tables are flat arrays in zero-filled anonymous memory, indexed by region (block)
/// number relative to the start of the covered range. All mutation during a cycle happens
/// either single-threaded while planning or through the atomic operations on
/// [`RegionData`].
pub struct ParallelCompactData {
    covered: MemoryRegion,
    opts: CompactOptions,
    region_storage: Box<VirtualMemory>,
    block_storage: Box<VirtualMemory>,
}

impl ParallelCompactData {
    pub fn new(covered: MemoryRegion, opts: CompactOptions) -> Result<Self, CollectorError> {
        assert_eq!(covered.size(), opts.covered_bytes);

        let region_bytes = opts.region_count * size_of::<RegionData>();
        let region_storage = VirtualMemory::allocate_aligned(region_bytes, page_size(), "region table")
            .ok_or_else(|| CollectorError::reservation("region table", region_bytes))?;

        let block_bytes = opts.block_count * size_of::<BlockData>();
        let block_storage = VirtualMemory::allocate_aligned(block_bytes, page_size(), "block table")
            .ok_or_else(|| CollectorError::reservation("block table", block_bytes))?;

        Ok(Self {
            covered,
            opts,
            region_storage,
            block_storage,
        })
    }

    pub fn covered(&self) -> MemoryRegion {
        self.covered
    }

    pub fn options(&self) -> &CompactOptions {
        &self.opts
    }

    pub fn region_count(&self) -> usize {
        self.opts.region_count
    }

    pub fn block_count(&self) -> usize {
        self.opts.block_count
    }

    pub fn regions(&self) -> &[RegionData] {
        // Zero-filled memory is a valid table of empty regions.
        unsafe {
            std::slice::from_raw_parts(
                self.region_storage.start() as *const RegionData,
                self.opts.region_count,
            )
        }
    }

    fn blocks(&self) -> &[BlockData] {
        unsafe {
            std::slice::from_raw_parts(
                self.block_storage.start() as *const BlockData,
                self.opts.block_count,
            )
        }
    }

    #[inline]
    pub fn region(&self, region_idx: usize) -> &RegionData {
        assert!(
            region_idx < self.opts.region_count,
            "region index is out of bounds: {} >= {}",
            region_idx,
            self.opts.region_count
        );
        &self.regions()[region_idx]
    }

    #[inline]
    pub fn block(&self, block_idx: usize) -> &BlockData {
        assert!(
            block_idx < self.opts.block_count,
            "block index is out of bounds: {} >= {}",
            block_idx,
            self.opts.block_count
        );
        &self.blocks()[block_idx]
    }

    #[inline]
    fn word_offset(&self, addr: usize) -> usize {
        assert!(
            addr >= self.covered.start() && addr <= self.covered.end(),
            "address 0x{:x} outside of covered range {:?}",
            addr,
            self.covered
        );
        pointer_delta(addr, self.covered.start())
    }

    /// Index of the region containing `addr`. The end of the covered range maps to
    /// [`region_count`](Self::region_count).
    #[inline]
    pub fn addr_to_region_idx(&self, addr: usize) -> usize {
        self.word_offset(addr) >> self.opts.log2_region_words
    }

    #[inline]
    pub fn addr_to_region(&self, addr: usize) -> &RegionData {
        self.region(self.addr_to_region_idx(addr))
    }

    #[inline]
    pub fn region_to_addr(&self, region_idx: usize) -> usize {
        debug_assert!(region_idx <= self.opts.region_count);
        self.covered.start() + (region_idx << self.opts.log2_region_bytes)
    }

    /// Offset of `addr` within its region, in words.
    #[inline]
    pub fn region_offset(&self, addr: usize) -> usize {
        self.word_offset(addr) & self.opts.region_words_mask
    }

    pub fn region_align_down(&self, addr: usize) -> usize {
        let start = self.covered.start();
        start + align_down(addr - start, self.opts.region_size_bytes)
    }

    pub fn region_align_up(&self, addr: usize) -> usize {
        let start = self.covered.start();
        start + align_up(addr - start, self.opts.region_size_bytes)
    }

    pub fn is_region_aligned(&self, addr: usize) -> bool {
        self.region_offset(addr) == 0
    }

    #[inline]
    pub fn addr_to_block_idx(&self, addr: usize) -> usize {
        self.word_offset(addr) >> self.opts.log2_block_words
    }

    #[inline]
    pub fn block_to_addr(&self, block_idx: usize) -> usize {
        self.covered.start() + (block_idx << self.opts.log2_block_bytes)
    }

    pub fn block_align_down(&self, addr: usize) -> usize {
        let start = self.covered.start();
        start + align_down(addr - start, self.opts.block_size_bytes)
    }

    #[inline]
    pub fn region_to_block_idx(&self, region_idx: usize) -> usize {
        region_idx << self.opts.log2_blocks_per_region
    }

    #[inline]
    fn words(&self, words: usize) -> usize {
        words << LOG_BYTES_PER_WORD
    }

    /// Accounts the live object `[addr, addr + len)`.
    ///
    /// The region holding the object's head gets the head's words as live data; every
    /// region the object reaches into records it as its partial object.
    pub fn add_obj(&self, addr: usize, len: usize) {
        debug_assert!(len > 0);
        let obj_ofs = self.word_offset(addr);
        let log2 = self.opts.log2_region_words;
        let beg_region = obj_ofs >> log2;
        let end_region = (obj_ofs + len - 1) >> log2;

        if beg_region == end_region {
            self.region(beg_region).add_live_obj(len);
            return;
        }

        let beg_ofs = obj_ofs & self.opts.region_words_mask;
        self.region(beg_region)
            .add_live_obj(self.opts.region_size_words - beg_ofs);

        for region_idx in beg_region + 1..end_region {
            let region = self.region(region_idx);
            region.set_partial_obj_size(self.opts.region_size_words);
            region.set_partial_obj_addr(addr);
        }

        let end_ofs = (obj_ofs + len - 1) & self.opts.region_words_mask;
        let region = self.region(end_region);
        region.set_partial_obj_size(end_ofs + 1);
        region.set_partial_obj_addr(addr);
    }

    /// Gives every region in `[beg, end)` an identity mapping: nothing there moves.
    pub fn summarize_dense_prefix(&self, beg: usize, end: usize) {
        debug_assert!(self.is_region_aligned(beg), "not region aligned");
        debug_assert!(self.is_region_aligned(end), "not region aligned");

        let end_region = self.addr_to_region_idx(end);
        for region_idx in self.addr_to_region_idx(beg)..end_region {
            let region = self.region(region_idx);
            region.set_destination(self.region_to_addr(region_idx));
            region.set_destination_count(0);
            region.set_source_region(region_idx);
            // Appear completely full so forwarding takes the identity fast path.
            region.set_live_obj_size(self.opts.region_size_words - region.partial_obj_size());
        }
    }

    /// Assigns destinations to the regions of `[source_beg, source_end)`, packing their
    /// live data contiguously from `target_beg`.
    ///
    /// Returns false if a region does not fit below `target_end`; `source_next` is then
    /// that region's address and `target_next` where it would have gone. Regions are
    /// never split. On success `target_next` is the end of the packed data.
    pub fn summarize(
        &self,
        target_beg: usize,
        target_end: usize,
        source_beg: usize,
        source_end: usize,
        target_next: &mut usize,
        source_next: &mut usize,
    ) -> bool {
        log::trace!(
            target: "gc-compact",
            "summarize target [0x{:x}, 0x{:x}) source [0x{:x}, 0x{:x})",
            target_beg,
            target_end,
            source_beg,
            source_end
        );

        let end_region = self.addr_to_region_idx(self.region_align_up(source_end));
        let mut cur_region = self.addr_to_region_idx(source_beg);
        let mut dest_addr = target_beg;

        while cur_region < end_region {
            let region = self.region(cur_region);
            // The destination must be set even if the region has no data.
            region.set_destination(dest_addr);

            let words = region.data_size();
            if words > 0 {
                if dest_addr + self.words(words) > target_end {
                    assert!(
                        region.partial_obj_size() == 0,
                        "region {} starts inside an object and cannot be moved alone",
                        cur_region
                    );
                    *target_next = dest_addr;
                    *source_next = self.region_to_addr(cur_region);
                    return false;
                }

                // A region compacted completely into itself does not count itself,
                // so a zero count always means the region can be claimed.
                let last_addr = dest_addr + self.words(words - 1);
                let dest_region_1 = self.addr_to_region_idx(dest_addr);
                let dest_region_2 = self.addr_to_region_idx(last_addr);

                let mut destination_count = if cur_region == dest_region_2 { 0 } else { 1 };
                if dest_region_1 != dest_region_2 {
                    destination_count += 1;
                    // The tail of this region's data lands at the start of dest_region_2.
                    self.region(dest_region_2).set_source_region(cur_region);
                } else if self.region_offset(dest_addr) == 0 {
                    self.region(dest_region_1).set_source_region(cur_region);
                }

                region.set_destination_count(destination_count);
                dest_addr += self.words(words);
            }

            cur_region += 1;
        }

        *target_next = dest_addr;
        true
    }

    /// End of the partial object that reaches into `region_idx`, or the region start if
    /// there is none.
    pub fn partial_obj_end(&self, region_idx: usize) -> usize {
        let mut result = self.region_to_addr(region_idx);
        let mut cur = region_idx;

        while cur < self.opts.region_count {
            let partial = self.region(cur).partial_obj_size();
            result += self.words(partial);
            if partial != self.opts.region_size_words {
                break;
            }
            cur += 1;
        }

        result
    }

    /// Records, for each block of `region_idx` in which an object starts, the live words
    /// in the region to the left of that first object. Idempotent.
    pub fn fill_blocks(&self, region_idx: usize, bitmap: &ParMarkBitmap) {
        let region = self.region(region_idx);
        let partial_obj_size = region.partial_obj_size();
        if partial_obj_size >= self.opts.region_size_words {
            // No object starts in this region.
            region.set_blocks_filled();
            return;
        }

        let region_beg = self.region_to_addr(region_idx);
        let beg_bit = bitmap.addr_to_bit(region_beg);
        let range_end = beg_bit + self.opts.region_size_words;
        let log2_block_words = self.opts.log2_block_words;

        // Ensures the first object found starts a new block.
        let mut cur_block = usize::MAX;
        let mut live_bits = partial_obj_size;
        let mut cur_beg = bitmap.find_obj_beg(beg_bit + live_bits, range_end);

        while cur_beg < range_end {
            let new_block = cur_beg >> log2_block_words;
            if new_block != cur_block {
                cur_block = new_block;
                self.block(cur_block).set_offset(live_bits);
            }

            let cur_end = bitmap.find_obj_end(cur_beg, range_end);
            if cur_end >= range_end - 1 {
                break;
            }
            live_bits += ParMarkBitmap::obj_size(cur_beg, cur_end);
            cur_beg = bitmap.find_obj_beg(cur_end + 1, range_end);
        }

        region.set_blocks_filled();
    }

    /// New address of the live word at `addr`.
    ///
    /// `addr` may be the start of a live object or any address inside one, including the
    /// parts of an object that lie in later regions than its head.
    pub fn calc_new_pointer(&self, addr: usize, bitmap: &ParMarkBitmap) -> usize {
        let region_idx = self.addr_to_region_idx(addr);
        let region = self.region(region_idx);
        let offset = self.region_offset(addr);

        if region.data_size() == self.opts.region_size_words || offset < region.partial_obj_size() {
            return region.destination() + self.words(offset);
        }

        if bitmap.is_unmarked(addr) {
            let obj = self.live_obj_containing(region_idx, addr, bitmap);
            return self.calc_new_pointer(obj, bitmap) + (addr - obj);
        }

        if !region.blocks_filled() {
            // Racing fills write the same values.
            self.fill_blocks(region_idx, bitmap);
        }

        let block_offset = self.block(self.addr_to_block_idx(addr)).offset();
        let live = bitmap.live_words_in_range(self.block_align_down(addr), addr);
        let result = region.destination() + self.words(block_offset + live);
        debug_assert_eq!(
            result,
            self.region_calc_new_pointer(addr, bitmap),
            "block table disagrees with region scan for 0x{:x}",
            addr
        );
        result
    }

    /// Forwarding of an object start by scanning the bitmap from the region start.
    pub fn region_calc_new_pointer(&self, addr: usize, bitmap: &ParMarkBitmap) -> usize {
        let region_idx = self.addr_to_region_idx(addr);
        let region = self.region(region_idx);
        let live = bitmap.live_words_in_range(self.region_to_addr(region_idx), addr);
        region.destination() + self.words(region.partial_obj_size() + live)
    }

    fn live_obj_containing(&self, region_idx: usize, addr: usize, bitmap: &ParMarkBitmap) -> usize {
        let limit = bitmap.addr_to_bit(self.region_to_addr(region_idx));
        let bit = bitmap.addr_to_bit(addr);
        let obj = match bitmap.find_prev_obj_beg(limit, bit + 1) {
            Some(beg) => bitmap.bit_to_addr(beg),
            None => panic!("address 0x{:x} is not inside a live object", addr),
        };
        assert!(
            addr < obj + self.words(bitmap.obj_size_at(obj)),
            "address 0x{:x} is not inside a live object",
            addr
        );
        obj
    }

    /// Resets every region and block intersecting `[beg, end)`.
    pub fn clear_range(&self, beg: usize, end: usize) {
        let beg_region = self.addr_to_region_idx(beg);
        let end_region = self.addr_to_region_idx(self.region_align_up(end));

        for region in &self.regions()[beg_region..end_region] {
            region.clear();
        }

        let beg_block = self.region_to_block_idx(beg_region);
        let end_block = self.region_to_block_idx(end_region);
        for block in &self.blocks()[beg_block..end_block] {
            block.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{base::constants::BYTES_PER_WORD, heap::arguments::CompactArguments};

    use super::*;

    const BASE: usize = 0x4000_0000;
    const REGION_WORDS: usize = 64;

    fn addr(word: usize) -> usize {
        BASE + word * BYTES_PER_WORD
    }

    fn setup(regions: usize) -> (ParallelCompactData, ParMarkBitmap) {
        let args = CompactArguments {
            log2_region_words: 6,
            log2_block_words: 4,
            ..Default::default()
        };
        let covered = MemoryRegion::new(BASE, regions * REGION_WORDS * BYTES_PER_WORD);
        let opts = CompactOptions::new(&args, covered.size()).unwrap();
        (
            ParallelCompactData::new(covered, opts).unwrap(),
            ParMarkBitmap::new(covered).unwrap(),
        )
    }

    fn live(sd: &ParallelCompactData, bm: &ParMarkBitmap, objects: &[(usize, usize)]) {
        for &(word, size) in objects {
            assert!(bm.mark(addr(word), size));
            sd.add_obj(addr(word), size);
        }
    }

    fn summarize_all(sd: &ParallelCompactData, regions: usize) -> usize {
        let mut target_next = 0;
        let mut source_next = 0;
        assert!(sd.summarize(
            addr(0),
            addr(regions * REGION_WORDS),
            addr(0),
            addr(regions * REGION_WORDS),
            &mut target_next,
            &mut source_next,
        ));
        target_next
    }

    #[test]
    fn test_add_obj_partial_spans() {
        let (sd, bm) = setup(8);
        live(&sd, &bm, &[(60, 200)]);

        assert_eq!(sd.region(0).live_obj_size(), 4);
        assert_eq!(sd.region(0).partial_obj_size(), 0);
        for region_idx in 1..4 {
            assert_eq!(sd.region(region_idx).partial_obj_size(), REGION_WORDS);
            assert_eq!(sd.region(region_idx).partial_obj_addr(), addr(60));
            assert_eq!(sd.region(region_idx).live_obj_size(), 0);
        }
        assert_eq!(sd.region(4).partial_obj_size(), 4);
        assert_eq!(sd.region(4).partial_obj_addr(), addr(60));

        let total: usize = (0..8).map(|r| sd.region(r).data_size()).sum();
        assert_eq!(total, 200);
        assert_eq!(sd.partial_obj_end(1), addr(260));
        assert_eq!(sd.partial_obj_end(4), addr(260));
        assert_eq!(sd.partial_obj_end(5), addr(320));
    }

    #[test]
    fn test_destinations_are_monotonic() {
        let (sd, bm) = setup(8);
        live(
            &sd,
            &bm,
            &[(3, 10), (40, 30), (100, 5), (190, 90), (300, 4), (400, 60), (500, 12)],
        );
        let new_top = summarize_all(&sd, 8);
        assert_eq!(new_top, addr(10 + 30 + 5 + 90 + 4 + 60 + 12));

        let mut last = 0;
        for region_idx in 0..8 {
            let region = sd.region(region_idx);
            assert!(region.destination() <= sd.region_to_addr(region_idx), "must move left");
            if region.data_size() > 0 {
                assert!(region.destination() >= last);
                last = region.destination() + region.data_size() * BYTES_PER_WORD;
            }
            assert!(region.destination_count() <= 2);
        }
        assert_eq!(last, new_top);
    }

    #[test]
    fn test_summarize_stops_when_target_is_full() {
        let (sd, bm) = setup(8);
        live(&sd, &bm, &[(0, 40), (64, 40), (128, 40)]);

        let mut target_next = 0;
        let mut source_next = 0;
        let fits = sd.summarize(
            addr(0),
            addr(100),
            addr(0),
            addr(192),
            &mut target_next,
            &mut source_next,
        );
        assert!(!fits);
        assert_eq!(target_next, addr(80));
        assert_eq!(source_next, addr(128));
        assert_eq!(sd.region(1).destination(), addr(40));
    }

    #[test]
    fn test_straddling_object_forwards_contiguously() {
        let (sd, bm) = setup(8);
        // 50 words: 24 at the end of region 2, 26 at the start of region 3.
        live(&sd, &bm, &[(0, 10), (168, 50)]);
        summarize_all(&sd, 8);

        assert_eq!(sd.region(2).live_obj_size(), 24);
        assert_eq!(sd.region(3).partial_obj_size(), 26);

        let new_obj = sd.calc_new_pointer(addr(168), &bm);
        assert_eq!(new_obj, addr(10));
        for i in 0..50 {
            assert_eq!(
                sd.calc_new_pointer(addr(168 + i), &bm),
                new_obj + i * BYTES_PER_WORD,
                "word {} of the object",
                i
            );
        }
    }

    #[test]
    fn test_blocks_agree_with_expected_layout() {
        let (sd, bm) = setup(16);
        let mut objects = vec![];
        let mut word = 1;
        let mut size = 1;
        while word + size < 16 * REGION_WORDS {
            objects.push((word, size));
            word += size + (size % 7);
            size = size % 37 + 3;
        }
        live(&sd, &bm, &objects);
        summarize_all(&sd, 16);

        for region_idx in 0..16 {
            sd.fill_blocks(region_idx, &bm);
        }

        let mut expected = addr(0);
        for &(word, size) in &objects {
            assert_eq!(sd.calc_new_pointer(addr(word), &bm), expected);
            assert_eq!(sd.region_calc_new_pointer(addr(word), &bm), expected);
            expected += size * BYTES_PER_WORD;
        }
    }

    #[test]
    fn test_dense_prefix_is_identity() {
        let (sd, bm) = setup(4);
        live(&sd, &bm, &[(2, 10), (50, 30), (150, 8)]);
        sd.summarize_dense_prefix(addr(0), addr(128));

        assert_eq!(sd.calc_new_pointer(addr(2), &bm), addr(2));
        assert_eq!(sd.calc_new_pointer(addr(50), &bm), addr(50));
        assert_eq!(sd.calc_new_pointer(addr(70), &bm), addr(70));
        assert_eq!(sd.region(1).data_size(), REGION_WORDS);
        assert_eq!(sd.region(1).destination_count(), 0);

        sd.clear_range(addr(0), addr(256));
        assert!(sd.regions().iter().all(|r| r.data_size() == 0 && r.available()));
    }

    #[test]
    #[should_panic]
    fn test_dead_address_is_fatal() {
        let (sd, bm) = setup(4);
        live(&sd, &bm, &[(10, 4), (100, 4)]);
        summarize_all(&sd, 4);
        sd.calc_new_pointer(addr(20), &bm);
    }
}
