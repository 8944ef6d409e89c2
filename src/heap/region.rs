use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Bit layout of [`RegionData`]'s `dc_and_los` word.
///
/// ```text
///  31        27 26                                   0
/// +------------+--------------------------------------+
/// |     dc     |          live object size            |
/// +------------+--------------------------------------+
/// ```
///
/// `dc` holds the destination count while the region is available (`0..=7`). Claiming
/// moves it to [`DC_CLAIMED`] and completion to [`DC_COMPLETED`]; both are above every
/// possible count so the three states are ordered numerically and a claim is one CAS from
/// "count zero, live size N" to "claimed, live size N".
pub const DC_SHIFT: u32 = 27;
pub const DC_MASK: u32 = !0 << DC_SHIFT;
pub const DC_ONE: u32 = 1 << DC_SHIFT;
pub const LOS_MASK: u32 = !DC_MASK;
pub const DC_CLAIMED: u32 = 0x8 << DC_SHIFT;
pub const DC_COMPLETED: u32 = 0xc << DC_SHIFT;
/// Largest destination count representable while a region is still available.
pub const MAX_DESTINATION_COUNT: u32 = (DC_CLAIMED >> DC_SHIFT) - 1;

/// Per-region summary. Lives in a flat, zero-initialised side table indexed by region
/// number; an all-zero entry is a valid empty region.
///
/// Fields other than `dc_and_los` are written during single-threaded planning (or by the
/// one worker owning the region) and only read afterwards; they are atomics so the table
/// can be shared freely between workers.
#[derive(Default)]
pub struct RegionData {
    /// Where the first live word of this region is copied to.
    destination: AtomicUsize,
    /// First region whose data is copied into the span starting at this region.
    source_region: AtomicUsize,
    /// Start of the object that extends onto this region from the left, if any.
    partial_obj_addr: AtomicUsize,
    /// Words of that object lying in this region.
    partial_obj_size: AtomicU32,
    dc_and_los: AtomicU32,
    /// New address of an object whose interior was left for a post-compaction update.
    deferred_obj_addr: AtomicUsize,
    blocks_filled: AtomicBool,
    #[cfg(debug_assertions)]
    pushed: AtomicU32,
}

impl RegionData {
    pub fn destination(&self) -> usize {
        self.destination.load(Ordering::Relaxed)
    }

    pub fn set_destination(&self, addr: usize) {
        self.destination.store(addr, Ordering::Relaxed);
    }

    pub fn source_region(&self) -> usize {
        self.source_region.load(Ordering::Relaxed)
    }

    pub fn set_source_region(&self, region: usize) {
        self.source_region.store(region, Ordering::Relaxed);
    }

    pub fn partial_obj_addr(&self) -> usize {
        self.partial_obj_addr.load(Ordering::Relaxed)
    }

    pub fn set_partial_obj_addr(&self, addr: usize) {
        self.partial_obj_addr.store(addr, Ordering::Relaxed);
    }

    pub fn partial_obj_size(&self) -> usize {
        self.partial_obj_size.load(Ordering::Relaxed) as usize
    }

    pub fn set_partial_obj_size(&self, words: usize) {
        assert!(words <= LOS_MASK as usize, "partial object size overflow: {}", words);
        self.partial_obj_size.store(words as u32, Ordering::Relaxed);
    }

    pub fn deferred_obj_addr(&self) -> usize {
        self.deferred_obj_addr.load(Ordering::Relaxed)
    }

    pub fn set_deferred_obj_addr(&self, addr: usize) {
        self.deferred_obj_addr.store(addr, Ordering::Relaxed);
    }

    pub fn blocks_filled(&self) -> bool {
        self.blocks_filled.load(Ordering::Acquire)
    }

    pub fn set_blocks_filled(&self) {
        self.blocks_filled.store(true, Ordering::Release);
    }

    #[inline]
    fn raw(&self) -> u32 {
        self.dc_and_los.load(Ordering::Acquire)
    }

    /// Live words of objects that start in this region.
    pub fn live_obj_size(&self) -> usize {
        (self.raw() & LOS_MASK) as usize
    }

    /// Words that will be copied out of this region, partial object included.
    pub fn data_size(&self) -> usize {
        self.partial_obj_size() + self.live_obj_size()
    }

    pub fn destination_count(&self) -> u32 {
        self.raw() >> DC_SHIFT
    }

    /// Destination count is zero and nobody has claimed the region yet.
    pub fn available(&self) -> bool {
        self.raw() < DC_ONE
    }

    pub fn claimed(&self) -> bool {
        self.raw() >= DC_CLAIMED
    }

    pub fn completed(&self) -> bool {
        self.raw() >= DC_COMPLETED
    }

    pub fn set_destination_count(&self, count: u32) {
        assert!(
            count <= MAX_DESTINATION_COUNT,
            "destination count {} does not fit the packed state",
            count
        );
        let live = self.raw() & LOS_MASK;
        self.dc_and_los.store((count << DC_SHIFT) | live, Ordering::Release);
    }

    pub fn set_live_obj_size(&self, words: usize) {
        assert!(words <= LOS_MASK as usize, "live object size overflow: {}", words);
        let dc = self.raw() & DC_MASK;
        self.dc_and_los.store(dc | words as u32, Ordering::Release);
    }

    pub fn add_live_obj(&self, words: usize) {
        let live = self.live_obj_size();
        assert!(
            live + words <= LOS_MASK as usize,
            "live object size overflow: {} + {}",
            live,
            words
        );
        self.dc_and_los.fetch_add(words as u32, Ordering::AcqRel);
    }

    pub fn decrement_destination_count(&self) {
        let raw = self.raw();
        assert!(raw < DC_CLAIMED, "decrementing a claimed region");
        assert!(raw >= DC_ONE, "destination count underflow");
        self.dc_and_los.fetch_sub(DC_ONE, Ordering::AcqRel);
    }

    /// Atomically moves an available region to claimed. Fails if the destination count is
    /// not zero or another worker won the race.
    pub fn claim(&self) -> bool {
        let los = self.raw() & LOS_MASK;
        self.dc_and_los
            .compare_exchange(los, DC_CLAIMED | los, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Claims without synchronisation; only valid while a single thread owns the table.
    pub fn claim_unsafe(&self) -> bool {
        let raw = self.raw();
        if raw < DC_ONE {
            self.dc_and_los.store(DC_CLAIMED | raw, Ordering::Relaxed);
            return true;
        }

        false
    }

    /// Only the claiming worker may call this.
    pub fn set_completed(&self) {
        let raw = self.raw();
        assert!(raw >= DC_CLAIMED, "completing a region that was not claimed");
        assert!(raw < DC_COMPLETED, "region completed twice");
        self.dc_and_los
            .store(DC_COMPLETED | (raw & LOS_MASK), Ordering::Release);
    }

    /// Records a push onto a work queue; a region may be queued at most once per cycle.
    #[inline]
    pub fn note_pushed(&self) {
        #[cfg(debug_assertions)]
        {
            let prev = self.pushed.fetch_add(1, Ordering::Relaxed);
            assert!(prev == 0, "region pushed twice");
        }
    }

    pub fn clear(&self) {
        self.destination.store(0, Ordering::Relaxed);
        self.source_region.store(0, Ordering::Relaxed);
        self.partial_obj_addr.store(0, Ordering::Relaxed);
        self.partial_obj_size.store(0, Ordering::Relaxed);
        self.dc_and_los.store(0, Ordering::Relaxed);
        self.deferred_obj_addr.store(0, Ordering::Relaxed);
        self.blocks_filled.store(false, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        self.pushed.store(0, Ordering::Relaxed);
    }
}

/// Live words in the owning region to the left of the first object that starts in the
/// block. Only meaningful for blocks in which an object starts.
#[derive(Default)]
pub struct BlockData {
    offset: AtomicU32,
}

impl BlockData {
    pub fn offset(&self) -> usize {
        self.offset.load(Ordering::Relaxed) as usize
    }

    pub fn set_offset(&self, words: usize) {
        debug_assert!(words <= LOS_MASK as usize);
        self.offset.store(words as u32, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.offset.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicUsize, Arc, Barrier};

    use super::*;

    #[test]
    fn test_state_machine() {
        let r = RegionData::default();
        r.set_live_obj_size(100);
        r.set_destination_count(2);
        assert_eq!(r.destination_count(), 2);
        assert_eq!(r.live_obj_size(), 100);
        assert!(!r.available());
        assert!(!r.claim(), "claim must fail while the count is nonzero");

        r.decrement_destination_count();
        assert!(!r.claim());
        r.decrement_destination_count();
        assert!(r.available());
        assert_eq!(r.live_obj_size(), 100);

        assert!(r.claim());
        assert!(r.claimed() && !r.completed());
        assert!(!r.claim(), "second claim must fail");
        r.set_completed();
        assert!(r.completed());
        assert!(!r.available());
        assert!(!r.claim());
        assert_eq!(r.live_obj_size(), 100);
    }

    #[test]
    fn test_data_size_includes_partial() {
        let r = RegionData::default();
        r.add_live_obj(30);
        r.add_live_obj(12);
        r.set_partial_obj_size(7);
        assert_eq!(r.data_size(), 49);
        r.clear();
        assert_eq!(r.data_size(), 0);
        assert!(r.available());
    }

    #[test]
    #[should_panic]
    fn test_double_completion_is_fatal() {
        let r = RegionData::default();
        assert!(r.claim());
        r.set_completed();
        r.set_completed();
    }

    #[test]
    #[should_panic]
    fn test_destination_count_overflow_is_fatal() {
        RegionData::default().set_destination_count(MAX_DESTINATION_COUNT + 1);
    }

    #[test]
    #[should_panic]
    fn test_live_size_overflow_is_fatal() {
        let r = RegionData::default();
        r.set_live_obj_size(LOS_MASK as usize);
        r.add_live_obj(1);
    }

    #[test]
    fn test_claim_exclusivity() {
        const THREADS: usize = 8;
        const REGIONS: usize = 4096;

        let regions: Arc<Vec<RegionData>> = Arc::new(
            (0..REGIONS)
                .map(|i| {
                    let r = RegionData::default();
                    r.set_live_obj_size(i % 512);
                    r.set_destination_count(1);
                    r
                })
                .collect(),
        );
        let wins = Arc::new((0..REGIONS).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles = (0..THREADS)
            .map(|t| {
                let regions = regions.clone();
                let wins = wins.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for i in 0..REGIONS {
                        // Each region's last producer drops the count to zero.
                        if i % THREADS == t {
                            regions[i].decrement_destination_count();
                        }
                    }
                    for _ in 0..2 {
                        for (i, region) in regions.iter().enumerate() {
                            if region.available() && region.claim() {
                                wins[i].fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        for (i, region) in regions.iter().enumerate() {
            assert_eq!(wins[i].load(Ordering::Relaxed), 1, "region {}", i);
            assert!(region.claimed());
            assert_eq!(region.live_obj_size(), i % 512);
            assert!(!region.claim());
        }
    }
}
