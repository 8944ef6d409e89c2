use crate::base::{constants::BYTES_PER_WORD, memory_region::MemoryRegion};

use super::{
    adjust::AdjustPointer,
    arguments::{CompactOptions, SpaceConfig},
    error::CollectorError,
    is_aligned,
    mark_bitmap::ParMarkBitmap,
    object_model::ObjectModel,
    refs::{Ref, Traversal},
    space::SpaceInfo,
    summary::ParallelCompactData,
};

/// Everything a collection cycle reads and writes: the covered address range, the host's
/// object model, the mark bitmap, the region table and the spaces.
pub struct Heap<M: ObjectModel> {
    covered: MemoryRegion,
    opts: CompactOptions,
    model: M,
    bitmap: ParMarkBitmap,
    summary: ParallelCompactData,
    spaces: Vec<SpaceInfo>,
}

impl<M: ObjectModel> Heap<M> {
    pub fn new(
        covered: MemoryRegion,
        opts: CompactOptions,
        spaces: &[SpaceConfig],
        model: M,
    ) -> Result<Self, CollectorError> {
        Self::validate_spaces(covered, &opts, spaces)?;

        let bitmap = ParMarkBitmap::new(covered)?;
        let summary = ParallelCompactData::new(covered, opts)?;

        Ok(Self {
            covered,
            opts,
            model,
            bitmap,
            summary,
            spaces: spaces.iter().map(SpaceInfo::new).collect(),
        })
    }

    fn validate_spaces(
        covered: MemoryRegion,
        opts: &CompactOptions,
        spaces: &[SpaceConfig],
    ) -> Result<(), CollectorError> {
        let invalid = |msg: String| Err(CollectorError::InvalidConfiguration(msg));

        if spaces.is_empty() {
            return invalid("at least one space is required".to_string());
        }

        let mut prev_end = covered.start();
        for space in spaces {
            if space.bottom >= space.end {
                return invalid(format!("space {} is empty or inverted", space.name));
            }
            if space.bottom < covered.start() || space.end > covered.end() {
                return invalid(format!(
                    "space {} [0x{:x}, 0x{:x}) is outside of the covered range {:?}",
                    space.name, space.bottom, space.end, covered
                ));
            }
            let region_aligned = |addr: usize| is_aligned(addr - covered.start(), opts.region_size_bytes);
            if !region_aligned(space.bottom) || !region_aligned(space.end) {
                return invalid(format!("space {} is not region aligned", space.name));
            }
            if space.top < space.bottom || space.top > space.end || !is_aligned(space.top, BYTES_PER_WORD) {
                return invalid(format!("space {} has an invalid top 0x{:x}", space.name, space.top));
            }
            if space.bottom < prev_end {
                return invalid(format!(
                    "space {} overlaps or precedes the previous space",
                    space.name
                ));
            }
            prev_end = space.end;
        }

        Ok(())
    }

    pub fn covered(&self) -> MemoryRegion {
        self.covered
    }

    pub fn options(&self) -> &CompactOptions {
        &self.opts
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn bitmap(&self) -> &ParMarkBitmap {
        &self.bitmap
    }

    pub fn summary(&self) -> &ParallelCompactData {
        &self.summary
    }

    pub fn spaces(&self) -> &[SpaceInfo] {
        &self.spaces
    }

    pub fn space(&self, space_id: usize) -> &SpaceInfo {
        &self.spaces[space_id]
    }

    pub fn space_mut(&mut self, space_id: usize) -> &mut SpaceInfo {
        &mut self.spaces[space_id]
    }

    /// Shared tables plus exclusive access to the spaces, for per-space planning.
    pub fn planning_view(&mut self) -> (&ParallelCompactData, &ParMarkBitmap, &M, &mut [SpaceInfo]) {
        (&self.summary, &self.bitmap, &self.model, &mut self.spaces)
    }

    #[inline]
    pub fn is_in(&self, addr: usize) -> bool {
        self.covered.contains(addr)
    }

    pub fn space_id(&self, addr: usize) -> Option<usize> {
        if !self.is_in(addr) {
            return None;
        }

        self.spaces.iter().position(|space| space.contains(addr))
    }

    /// True if `addr` may hold an object of some space, which is what marking follows.
    pub fn is_in_space(&self, addr: usize) -> bool {
        self.space_id(addr).is_some()
    }

    /// True if `addr` is any word of an object marked in the current cycle.
    pub fn is_live_word(&self, addr: usize) -> bool {
        if self.bitmap.is_marked(addr) {
            return true;
        }

        let space = match self.space_id(addr) {
            Some(id) => &self.spaces[id],
            None => return false,
        };
        let limit = self.bitmap.addr_to_bit(space.bottom());
        match self.bitmap.find_prev_obj_beg(limit, self.bitmap.addr_to_bit(addr)) {
            Some(beg) => {
                let obj = self.bitmap.bit_to_addr(beg);
                addr < obj + self.bitmap.obj_size_at(obj) * BYTES_PER_WORD
            }
            None => false,
        }
    }

    /// Forwarding address of a live word.
    #[inline]
    pub fn calc_new_pointer(&self, addr: usize) -> usize {
        self.summary.calc_new_pointer(addr, &self.bitmap)
    }

    /// Forwarding of a metadata reference. Metadata outside of the spaces, or inside a
    /// dense prefix, does not move.
    pub fn calc_new_metadata(&self, addr: usize) -> usize {
        match self.space_id(addr) {
            Some(id) if addr >= self.spaces[id].dense_prefix() => self.calc_new_pointer(addr),
            _ => addr,
        }
    }

    /// Rewrites every reference of the object now at `obj`, metadata included.
    ///
    /// # Safety
    ///
    /// `obj` must hold a complete object whose references still carry pre-compaction
    /// addresses.
    pub unsafe fn update_contents(&self, obj: usize) {
        let mut adjust = AdjustPointer::new(self, Traversal::Heap);
        self.model.visit_references(obj, &mut adjust);

        if let Some(slot) = self.model.metadata_slot(obj) {
            let metadata = slot.load();
            if !metadata.is_null() {
                slot.store(Ref::encode(self.calc_new_metadata(metadata.decode())));
            }
        }
    }
}
