//! Per-space compaction planning.
//!
//! Every space is first summarized into itself from its bottom, which yields the new top
//! of a full compaction. The dense prefix is then chosen from that summary: the leading
//! part of the space where so little is dead that moving the objects costs more than the
//! space it would reclaim. Objects there stay put and only get their pointers updated.

use std::f64::consts::PI;

use crate::base::utils::pointer_delta;

use super::{
    mark_bitmap::ParMarkBitmap, object_model::ObjectModel, region::RegionData,
    space::SpaceInfo, summary::ParallelCompactData,
};

/// Bounds the dead space the dense prefix may keep, as a fraction of the space capacity,
/// based on how full the space is.
///
/// The bound follows a normal distribution over the density, shifted so that a
/// completely full space gets exactly the space's minimum dead ratio.
#[derive(Clone, Copy, Debug)]
pub struct DeadWoodLimiter {
    mean: f64,
    std_dev: f64,
    first_term: f64,
    adjustment: f64,
}

impl DeadWoodLimiter {
    /// `mean` and `std_dev` are percentages, capped at 100.
    pub fn new(mean: usize, std_dev: usize) -> Self {
        let mean = mean.min(100) as f64 / 100.0;
        let std_dev = std_dev.clamp(1, 100) as f64 / 100.0;
        let mut limiter = Self {
            mean,
            std_dev,
            first_term: 1.0 / ((2.0 * PI).sqrt() * std_dev),
            adjustment: 0.0,
        };
        limiter.adjustment = limiter.normal_distribution(1.0);
        limiter
    }

    #[inline]
    pub fn normal_distribution(&self, density: f64) -> f64 {
        let squared_term = (density - self.mean) / self.std_dev;
        self.first_term * (-0.5 * squared_term * squared_term).exp()
    }

    /// Allowed dead wood as a fraction of capacity; `min_percent` at density 1, never
    /// negative.
    pub fn limit(&self, density: f64, min_percent: usize) -> f64 {
        let raw_limit = self.normal_distribution(density);
        let min = min_percent as f64 / 100.0;
        (raw_limit - self.adjustment + min).max(0.0)
    }
}

/// First region in `[beg, end)` that has dead space to its left or is not completely
/// full. Relies on the summary compacting the space into itself from its bottom.
pub fn first_dead_space_region(sd: &ParallelCompactData, beg: usize, end: usize) -> usize {
    let region_size = sd.options().region_size_words;
    let mut left = beg;
    let mut right = if end > beg { end - 1 } else { left };

    while left < right {
        let middle = left + (right - left) / 2;
        let region = sd.region(middle);
        let dest = region.destination();
        let addr = sd.region_to_addr(middle);
        assert!(dest <= addr, "region {} must move left", middle);

        if middle > left && dest < addr {
            right = middle - 1;
        } else if middle < right && region.data_size() == region_size {
            left = middle + 1;
        } else {
            return middle;
        }
    }

    left
}

/// Region in `[beg, end)` with roughly `dead_words` of dead space to its left.
pub fn dead_wood_limit_region(
    sd: &ParallelCompactData,
    beg: usize,
    end: usize,
    dead_words: usize,
) -> usize {
    let mut left = beg;
    let mut right = if end > beg { end - 1 } else { left };

    while left < right {
        let middle = left + (right - left) / 2;
        let dest = sd.region(middle).destination();
        let addr = sd.region_to_addr(middle);
        assert!(dest <= addr, "region {} must move left", middle);

        let dead_to_left = pointer_delta(addr, dest);
        if middle > left && dead_to_left > dead_words {
            right = middle - 1;
        } else if middle < right && dead_to_left < dead_words {
            left = middle + 1;
        } else {
            return middle;
        }
    }

    left
}

/// Space reclaimed by compacting from `region_idx` onward, relative to the cost: the
/// words to update in place plus the words to copy, copying weighted by 1.25.
pub fn reclaimed_ratio(
    sd: &ParallelCompactData,
    region_idx: usize,
    bottom: usize,
    top: usize,
    new_top: usize,
) -> f64 {
    let destination = sd.region(region_idx).destination();
    debug_assert!(top >= new_top && new_top > bottom);
    debug_assert!(new_top >= destination);

    let dense_prefix_live = pointer_delta(destination, bottom);
    let compacted_region_live = pointer_delta(new_top, destination);
    let compacted_region_used = pointer_delta(top, sd.region_to_addr(region_idx));
    let reclaimable = compacted_region_used - compacted_region_live;

    let divisor = dense_prefix_live as f64 + 1.25 * compacted_region_live as f64;
    reclaimable as f64 / divisor
}

/// End of the dense prefix for `space`; region aligned.
///
/// Returns the bottom for an empty space and under maximum compaction. Otherwise the
/// leading run of full regions is always included and the boundary is the region with
/// the best [`reclaimed_ratio`] among those whose dead space to the left stays within
/// the limiter's budget. Ties go to the left-most region.
pub fn compute_dense_prefix(
    sd: &ParallelCompactData,
    space: &SpaceInfo,
    limiter: &DeadWoodLimiter,
    maximum_compaction: bool,
) -> usize {
    let bottom = space.bottom();
    let top = space.top();
    let new_top = space.new_top();

    if new_top == bottom || maximum_compaction {
        return bottom;
    }

    let beg_region = sd.addr_to_region_idx(bottom);
    let top_region = sd.addr_to_region_idx(sd.region_align_up(top));
    let new_top_region = sd.addr_to_region_idx(sd.region_align_up(new_top));

    // Full regions at the start of the space are necessarily part of the dense prefix.
    let full_region = first_dead_space_region(sd, beg_region, new_top_region);

    let space_live = pointer_delta(new_top, bottom);
    let space_used = space.used_in_words();
    let space_capacity = space.capacity_in_words();

    let density = space_live as f64 / space_capacity as f64;
    let limit = limiter.limit(density, space.dead_ratio());
    let dead_wood_max = space_used - space_live;
    let dead_wood_limit = ((space_capacity as f64 * limit) as usize).min(dead_wood_max);

    let limit_region = dead_wood_limit_region(sd, full_region, top_region, dead_wood_limit);

    let mut best_ratio = 0.0;
    let mut best_region = full_region;
    for region_idx in full_region..limit_region {
        let ratio = reclaimed_ratio(sd, region_idx, bottom, top, new_top);
        if ratio > best_ratio {
            best_region = region_idx;
            best_ratio = ratio;
        }
    }

    log::debug!(
        target: "gc-compact",
        "{}: density {:.3}, dead wood limit {} words, full region {}, limit region {}, chose region {} (ratio {:.3})",
        space.name(),
        density,
        dead_wood_limit,
        full_region,
        limit_region,
        best_region,
        best_ratio
    );

    sd.region_to_addr(best_region)
}

/// True if dead space runs across the start of `region`, which is at `bit`.
///
/// That is the case when no partial object reaches into the region, no object starts at
/// its first word and none ends at the last word of the previous region.
pub fn dead_space_crosses_boundary(region: &RegionData, bit: usize, bitmap: &ParMarkBitmap) -> bool {
    assert!(bit > 0, "cannot call this for the first bit");
    region.partial_obj_size() == 0 && !bitmap.is_obj_start(bit) && !bitmap.is_obj_end(bit - 1)
}

/// If dead space crosses the dense prefix boundary, turns its part left of the boundary
/// into a live filler so the prefix ends with an object.
///
/// The filler reaches right of the boundary only when the dead run to the left is
/// smaller than the model's minimum object.
pub fn fill_dense_prefix_end<M: ObjectModel + ?Sized>(
    sd: &ParallelCompactData,
    bitmap: &ParMarkBitmap,
    model: &M,
    space: &SpaceInfo,
) {
    let dense_prefix_end = space.dense_prefix();
    let bit = bitmap.addr_to_bit(dense_prefix_end);
    if !dead_space_crosses_boundary(sd.addr_to_region(dense_prefix_end), bit, bitmap) {
        return;
    }

    let bottom_bit = bitmap.addr_to_bit(space.bottom());
    let obj_beg = match bitmap.find_prev_obj_end(bottom_bit, bit) {
        Some(end) => bitmap.bit_to_addr(end + 1),
        None => space.bottom(),
    };

    let mut obj_len = pointer_delta(dense_prefix_end, obj_beg);
    if obj_len < model.min_object_words() {
        let next_live = bitmap.find_obj_beg_addr(dense_prefix_end, space.top());
        obj_len = model.min_object_words();
        assert!(
            pointer_delta(next_live, obj_beg) >= obj_len,
            "dead space at 0x{:x} is smaller than the minimum object",
            obj_beg
        );
    }

    log::trace!(
        target: "gc-compact",
        "{}: filling {} words at 0x{:x} before dense prefix end 0x{:x}",
        space.name(),
        obj_len,
        obj_beg,
        dense_prefix_end
    );

    unsafe {
        model.fill_with_dead(obj_beg, obj_len);
    }
    bitmap.mark(obj_beg, obj_len);
    sd.add_obj(obj_beg, obj_len);
    space.start_array().allocate_block(obj_beg);
}

/// Summarizes `space` into itself from its bottom, which is the plan of a maximum
/// compaction.
pub fn summarize_space_quick(sd: &ParallelCompactData, space: &mut SpaceInfo) {
    let mut new_top = space.bottom();
    let mut source_next = space.bottom();
    let fits = sd.summarize(
        space.bottom(),
        space.end(),
        space.bottom(),
        space.top(),
        &mut new_top,
        &mut source_next,
    );
    assert!(fits, "space {} must fit into itself", space.name());

    space.set_new_top(new_top);
    space.set_dense_prefix(space.bottom());
}

/// Chooses the dense prefix of `space` and, if there is one, replans the space around it.
pub fn summarize_space<M: ObjectModel + ?Sized>(
    sd: &ParallelCompactData,
    bitmap: &ParMarkBitmap,
    model: &M,
    space: &mut SpaceInfo,
    limiter: &DeadWoodLimiter,
    maximum_compaction: bool,
) {
    if space.new_top() == space.bottom() {
        return;
    }

    let dense_prefix_end = compute_dense_prefix(sd, space, limiter, maximum_compaction);
    space.set_dense_prefix(dense_prefix_end);

    if !maximum_compaction && dense_prefix_end != space.bottom() {
        // Done before destinations are final so no unfillable fragment of dead space is
        // left at the boundary.
        fill_dense_prefix_end(sd, bitmap, model, space);

        sd.summarize_dense_prefix(space.bottom(), dense_prefix_end);

        let mut new_top = dense_prefix_end;
        let mut source_next = dense_prefix_end;
        let fits = sd.summarize(
            dense_prefix_end,
            space.end(),
            dense_prefix_end,
            space.top(),
            &mut new_top,
            &mut source_next,
        );
        assert!(fits, "space {} must fit into itself", space.name());
        space.set_new_top(new_top);
    }

    log::debug!(
        target: "gc-compact",
        "{}: dense prefix 0x{:x} ({} regions), new top 0x{:x}",
        space.name(),
        dense_prefix_end,
        pointer_delta(dense_prefix_end, space.bottom()) >> sd.options().log2_region_words,
        space.new_top()
    );
}

#[cfg(test)]
mod tests {
    use crate::{
        base::{constants::BYTES_PER_WORD, memory_region::MemoryRegion},
        heap::arguments::{CompactArguments, CompactOptions, SpaceConfig},
    };

    use super::*;

    const BASE: usize = 0x4000_0000;
    const REGIONS: usize = 8;

    fn addr(word: usize) -> usize {
        BASE + word * BYTES_PER_WORD
    }

    fn planned(objects: &[(usize, usize)], top_word: usize) -> (ParallelCompactData, ParMarkBitmap, SpaceInfo) {
        let args = CompactArguments {
            log2_region_words: 6,
            log2_block_words: 4,
            ..Default::default()
        };
        let covered = MemoryRegion::new(BASE, REGIONS * 64 * BYTES_PER_WORD);
        let opts = CompactOptions::new(&args, covered.size()).unwrap();
        let sd = ParallelCompactData::new(covered, opts).unwrap();
        let bitmap = ParMarkBitmap::new(covered).unwrap();

        let mut config = SpaceConfig::old("old", covered.start(), covered.end());
        config.top = addr(top_word);
        let mut space = SpaceInfo::new(&config);

        for &(word, size) in objects {
            bitmap.mark(addr(word), size);
            sd.add_obj(addr(word), size);
        }
        summarize_space_quick(&sd, &mut space);
        (sd, bitmap, space)
    }

    #[test]
    fn test_limiter_shape() {
        let limiter = DeadWoodLimiter::new(50, 80);
        assert!((limiter.limit(1.0, 5) - 0.05).abs() < 1e-9);
        assert!(limiter.limit(0.5, 0) > limiter.limit(0.9, 0));
        for i in 0..=100 {
            assert!(limiter.limit(i as f64 / 100.0, 0) >= 0.0);
        }

        // A mean far from the middle would go negative without the clamp.
        let skewed = DeadWoodLimiter::new(100, 10);
        assert_eq!(skewed.limit(0.0, 0), 0.0);
    }

    #[test]
    fn test_maximum_compaction_has_no_prefix() {
        let (sd, _, space) = planned(&[(0, 64), (64, 64), (128, 64), (200, 10)], 512);
        let limiter = DeadWoodLimiter::new(50, 80);
        assert_eq!(compute_dense_prefix(&sd, &space, &limiter, true), space.bottom());
        assert_ne!(compute_dense_prefix(&sd, &space, &limiter, false), space.bottom());
    }

    #[test]
    fn test_empty_space_has_no_prefix() {
        let (sd, _, space) = planned(&[], 300);
        let limiter = DeadWoodLimiter::new(50, 80);
        assert_eq!(space.new_top(), space.bottom());
        assert_eq!(compute_dense_prefix(&sd, &space, &limiter, false), space.bottom());
    }

    #[test]
    fn test_single_object_at_bottom() {
        let (sd, bitmap, mut space) = planned(&[(0, 10)], 512);
        let limiter = DeadWoodLimiter::new(50, 80);
        let model = NoFill;
        summarize_space(&sd, &bitmap, &model, &mut space, &limiter, false);

        assert_eq!(space.dense_prefix(), space.bottom());
        assert_eq!(space.new_top(), addr(10));
        assert_eq!(sd.calc_new_pointer(addr(0), &bitmap), addr(0));
    }

    #[test]
    fn test_dense_head_becomes_prefix() {
        // Four full regions, then a sparse tail.
        let objects = [(0, 64), (64, 64), (128, 64), (192, 64), (256, 8), (320, 8), (384, 8)];
        let (sd, bitmap, mut space) = planned(&objects, 512);
        assert_eq!(space.new_top(), addr(280));

        assert_eq!(first_dead_space_region(&sd, 0, 5), 4);
        assert_eq!(dead_wood_limit_region(&sd, 4, 8, 70), 6);

        let limiter = DeadWoodLimiter::new(50, 80);
        let model = NoFill;
        summarize_space(&sd, &bitmap, &model, &mut space, &limiter, false);

        assert_eq!(space.dense_prefix(), addr(256));
        assert_eq!(space.new_top(), addr(280));
        assert_eq!(sd.calc_new_pointer(addr(64), &bitmap), addr(64));
        assert_eq!(sd.calc_new_pointer(addr(320), &bitmap), addr(264));
        assert_eq!(sd.calc_new_pointer(addr(384), &bitmap), addr(272));
    }

    #[test]
    fn test_dead_space_across_boundary_is_filled() {
        let (sd, bitmap, mut space) = planned(&[(0, 50), (70, 10)], 128);
        space.set_dense_prefix(addr(64));
        let model = NoFill;
        fill_dense_prefix_end(&sd, &bitmap, &model, &space);

        assert!(bitmap.is_marked(addr(50)));
        assert_eq!(bitmap.obj_size_at(addr(50)), 14);
        assert_eq!(sd.region(0).live_obj_size(), 64);
        assert!(space.start_array().is_block_allocated(addr(50)));
    }

    struct NoFill;

    impl ObjectModel for NoFill {
        unsafe fn object_size(&self, _addr: usize) -> usize {
            unreachable!()
        }

        unsafe fn visit_references(&self, _obj: usize, _visitor: &mut dyn crate::heap::refs::PointerVisitor) {}

        unsafe fn fill_with_dead(&self, _addr: usize, _words: usize) {}
    }
}
