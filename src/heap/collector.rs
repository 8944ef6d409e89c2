use std::time::{Duration, Instant};

use scoped_thread_pool::Pool;

use crate::{
    base::{constants::BYTES_PER_WORD, memory_region::MemoryRegion, utils::pointer_delta},
    formatted_size,
};

use super::{
    adjust::adjust_roots,
    arguments::{CompactArguments, CompactOptions, SpaceConfig},
    compact::{compact, CompactStats},
    dense_prefix::{summarize_space, summarize_space_quick, DeadWoodLimiter},
    error::CollectorError,
    heap::Heap,
    mark::{mark_live_objects, MarkStats},
    mark_bitmap::ParMarkBitmap,
    object_model::{ObjectModel, RootSet},
    space::SpaceInfo,
    summary::ParallelCompactData,
};

/// Per-space outcome of a collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpaceSummary {
    pub name: &'static str,
    pub used_before_words: usize,
    pub new_top: usize,
    pub dense_prefix: usize,
    pub live_words: usize,
}

impl SpaceSummary {
    pub fn used_before_bytes(&self) -> usize {
        self.used_before_words * BYTES_PER_WORD
    }

    pub fn live_bytes(&self) -> usize {
        self.live_words * BYTES_PER_WORD
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct PhaseTimes {
    pub mark: Duration,
    pub summary: Duration,
    pub compact: Duration,
    pub adjust: Duration,
}

#[derive(Clone, Debug)]
pub struct CollectionSummary {
    pub gc_number: usize,
    pub spaces: Vec<SpaceSummary>,
    pub live_objects: usize,
    pub maximum_compaction: bool,
    pub weak_roots_cleared: usize,
    pub compact: CompactStats,
    pub duration: Duration,
    pub phases: PhaseTimes,
}

/// The collector: owns the heap description, the side tables and the worker pool, and
/// runs one stop-the-world mark-compact cycle per [`invoke`](Self::invoke).
pub struct CollectorContext<M: ObjectModel> {
    args: CompactArguments,
    heap: Heap<M>,
    workers: Pool,
    nworkers: usize,
    limiter: DeadWoodLimiter,
    total_invocations: usize,
    maximum_compaction_gc_num: usize,
}

impl<M: ObjectModel> CollectorContext<M> {
    /// Sets the collector up over `covered`, which must contain every space.
    ///
    /// Fails without touching the heap if the configuration is inconsistent or the side
    /// tables cannot be mapped.
    pub fn new(
        args: CompactArguments,
        covered: MemoryRegion,
        spaces: Vec<SpaceConfig>,
        model: M,
    ) -> Result<Self, CollectorError> {
        let opts = CompactOptions::new(&args, covered.size())?;
        let heap = Heap::new(covered, opts, &spaces, model)?;

        log::info!(target: "gc", "Collector initialized over {:?} with {} worker(s)", covered, args.parallel_gc_threads);
        opts.log_sizes();
        for space in heap.spaces() {
            log::debug!(target: "gc", "{:?}", space);
        }

        Ok(Self {
            limiter: DeadWoodLimiter::new(args.dead_wood_limiter_mean, args.dead_wood_limiter_std_dev),
            workers: Pool::new(args.parallel_gc_threads),
            nworkers: args.parallel_gc_threads,
            heap,
            args,
            total_invocations: 0,
            maximum_compaction_gc_num: 0,
        })
    }

    pub fn arguments(&self) -> &CompactArguments {
        &self.args
    }

    pub fn options(&self) -> &CompactOptions {
        self.heap.options()
    }

    pub fn heap(&self) -> &Heap<M> {
        &self.heap
    }

    pub fn model(&self) -> &M {
        self.heap.model()
    }

    pub fn spaces(&self) -> &[SpaceInfo] {
        self.heap.spaces()
    }

    pub fn workers(&self) -> &Pool {
        &self.workers
    }

    pub fn total_invocations(&self) -> usize {
        self.total_invocations
    }

    pub fn top(&self, space_id: usize) -> usize {
        self.heap.space(space_id).top()
    }

    /// Moves the allocation top of a space; the host calls this as it allocates.
    pub fn set_top(&mut self, space_id: usize, top: usize) {
        self.heap.space_mut(space_id).set_top(top);
    }

    /// Forwarding address of a live word of the last collection. Valid until the next
    /// [`invoke`](Self::invoke).
    pub fn calc_new_pointer(&self, addr: usize) -> usize {
        self.heap.calc_new_pointer(addr)
    }

    /// Start of the object containing `addr`, as recorded during the last compaction.
    ///
    /// # Safety
    ///
    /// `addr` must lie below the top of its space and the space must not have been
    /// allocated into since the last collection without recording starts.
    pub unsafe fn object_start(&self, addr: usize) -> Option<usize> {
        let space = self.heap.space(self.heap.space_id(addr)?);
        if addr >= space.top() {
            return None;
        }

        Some(space.start_array().object_start(addr, self.heap.model()))
    }

    fn should_maximum_compact(&mut self, requested: bool) -> bool {
        let total = self.total_invocations;
        let gcs_since_max = total - self.maximum_compaction_gc_num;
        let interval_ended = gcs_since_max > self.args.maximum_compaction_interval
            || total == self.args.first_maximum_compaction_count;

        let maximum = requested || !self.args.use_dense_prefix || interval_ended;
        if maximum {
            self.maximum_compaction_gc_num = total;
        }
        maximum
    }

    /// Runs one full collection: mark from `roots`, plan, compact, then forward the roots.
    pub fn invoke(&mut self, roots: &mut dyn RootSet, maximum_compaction: bool) -> CollectionSummary {
        let start = Instant::now();
        self.total_invocations += 1;
        let maximum_compaction = self.should_maximum_compact(maximum_compaction);

        log::debug!(
            target: "gc",
            "GC({}) start, maximum compaction: {}",
            self.total_invocations,
            maximum_compaction
        );

        let used_before = self.pre_compact();
        let mut phases = PhaseTimes::default();

        let phase = Instant::now();
        let marked = mark_live_objects(&self.heap, &self.workers, self.nworkers, roots);
        phases.mark = phase.elapsed();
        log::debug!(
            target: "gc-mark",
            "marking done in {} ms: {} objects, {}",
            phases.mark.as_millis(),
            marked.objects,
            formatted_size(marked.words * BYTES_PER_WORD)
        );

        let phase = Instant::now();
        self.summary_phase(maximum_compaction);
        phases.summary = phase.elapsed();
        log::debug!(target: "gc-compact", "summary done in {} ms", phases.summary.as_millis());

        let phase = Instant::now();
        let compact_stats = compact(
            &self.heap,
            &self.workers,
            self.nworkers,
            self.args.dense_prefix_tasks_per_thread,
        );
        phases.compact = phase.elapsed();
        log::debug!(
            target: "gc-compact",
            "compaction done in {} ms: {} regions filled, {} dense prefix regions, {} words copied, {} deferred",
            phases.compact.as_millis(),
            compact_stats.regions_filled,
            compact_stats.dense_prefix_regions,
            compact_stats.words_copied,
            compact_stats.deferred_objects
        );

        let phase = Instant::now();
        let weak_roots_cleared = adjust_roots(&self.heap, roots);
        phases.adjust = phase.elapsed();
        log::debug!(
            target: "gc-compact",
            "root adjustment done in {} ms, {} weak root(s) cleared",
            phases.adjust.as_millis(),
            weak_roots_cleared
        );

        if self.args.verify {
            self.verify_complete(&used_before);
        }

        self.post_compact();

        let summary = CollectionSummary {
            gc_number: self.total_invocations,
            spaces: self
                .heap
                .spaces()
                .iter()
                .zip(&used_before)
                .map(|(space, &used_before_words)| SpaceSummary {
                    name: space.name(),
                    used_before_words,
                    new_top: space.new_top(),
                    dense_prefix: space.dense_prefix(),
                    live_words: space.live_words,
                })
                .collect(),
            live_objects: marked.objects,
            maximum_compaction,
            weak_roots_cleared,
            compact: compact_stats,
            duration: start.elapsed(),
            phases,
        };

        self.log_summary(&summary, marked);
        summary
    }

    /// Clears the side tables over every space and records how much each one used.
    fn pre_compact(&mut self) -> Vec<usize> {
        let mut used_before = Vec::with_capacity(self.heap.spaces().len());
        let (sd, bitmap, _, spaces) = self.heap.planning_view();

        for space in spaces.iter_mut() {
            bitmap.clear_range(space.bottom(), space.end());
            sd.clear_range(space.bottom(), space.end());
            space.start_array().reset();
            space.live_words = 0;
            space.live_objects = 0;
            used_before.push(space.used_in_words());
        }

        used_before
    }

    /// Plans every space in parallel: accounts live objects per region, chooses the dense
    /// prefix, assigns destinations and fills the block tables.
    fn summary_phase(&mut self, maximum_compaction: bool) {
        let limiter = &self.limiter;
        let (sd, bitmap, model, spaces) = self.heap.planning_view();

        // blocking call, waits for every space to be planned.
        self.workers.scoped(|scope| {
            for space in spaces.iter_mut() {
                scope.execute(move || {
                    add_live_objects(sd, bitmap, space);
                    summarize_space_quick(sd, space);
                    summarize_space(sd, bitmap, model, space, limiter, maximum_compaction);
                    fill_blocks(sd, bitmap, space);
                });
            }
        });
    }

    fn post_compact(&mut self) {
        for id in 0..self.heap.spaces().len() {
            let space = self.heap.space_mut(id);
            let new_top = space.new_top();
            space.set_top(new_top);
        }
    }

    /// Checks that every destination region was filled, every drained source region
    /// released, and that each space parses from bottom to its new top.
    fn verify_complete(&self, used_before: &[usize]) {
        let sd = self.heap.summary();

        for (space, &used) in self.heap.spaces().iter().zip(used_before) {
            let old_top = space.bottom() + used * BYTES_PER_WORD;
            let beg_region = sd.addr_to_region_idx(space.bottom());
            let new_top_region = sd.addr_to_region_idx(sd.region_align_up(space.new_top()));
            let old_top_region = sd.addr_to_region_idx(sd.region_align_up(old_top));

            for region_idx in beg_region..new_top_region {
                assert!(
                    sd.region(region_idx).completed(),
                    "{}: region {} was not completed",
                    space.name(),
                    region_idx
                );
            }

            for region_idx in new_top_region..old_top_region.max(new_top_region) {
                let region = sd.region(region_idx);
                assert!(
                    region.available(),
                    "{}: region {} was not drained (destination count {})",
                    space.name(),
                    region_idx,
                    region.destination_count()
                );
            }

            let model = self.heap.model();
            let mut addr = space.bottom();
            while addr < space.new_top() {
                unsafe {
                    assert_eq!(
                        space.start_array().object_start(addr, model),
                        addr,
                        "{}: object start at 0x{:x} was not recorded",
                        space.name(),
                        addr
                    );
                    addr += model.object_size(addr) * BYTES_PER_WORD;
                }
            }
            assert_eq!(addr, space.new_top(), "{}: last object overruns the new top", space.name());
        }

        log::trace!(target: "gc-compact", "verification passed");
    }

    fn log_summary(&self, summary: &CollectionSummary, marked: MarkStats) {
        for (space, info) in summary.spaces.iter().zip(self.heap.spaces()) {
            let bottom = info.bottom();
            log::info!(
                target: "gc",
                "GC({}) {}: {}->{} (dense prefix {})",
                summary.gc_number,
                space.name,
                formatted_size(space.used_before_bytes()),
                formatted_size(pointer_delta(space.new_top, bottom) * BYTES_PER_WORD),
                formatted_size(pointer_delta(space.dense_prefix, bottom) * BYTES_PER_WORD)
            );
        }

        log::info!(
            target: "gc",
            "GC({}) Pause Full{} {} live objects ({}) in {} ms",
            summary.gc_number,
            if summary.maximum_compaction { " (maximum compaction)" } else { "" },
            marked.objects,
            formatted_size(marked.words * BYTES_PER_WORD),
            summary.duration.as_millis()
        );
    }
}

/// Feeds the live objects of `space` to the region table in address order.
fn add_live_objects(sd: &ParallelCompactData, bitmap: &ParMarkBitmap, space: &mut SpaceInfo) {
    let mut words = 0;
    let mut objects = 0;

    for (addr, size) in bitmap.live_objects(space.bottom(), space.top()) {
        sd.add_obj(addr, size);
        words += size;
        objects += 1;
    }

    space.live_words = words;
    space.live_objects = objects;
}

/// Fills the block tables of the regions that will be forwarded through them.
fn fill_blocks(sd: &ParallelCompactData, bitmap: &ParMarkBitmap, space: &SpaceInfo) {
    let region_size = sd.options().region_size_words;
    let beg_region = sd.addr_to_region_idx(space.dense_prefix());
    let end_region = sd.addr_to_region_idx(sd.region_align_up(space.top()));

    for region_idx in beg_region..end_region {
        let data_size = sd.region(region_idx).data_size();
        if data_size > 0 && data_size < region_size {
            sd.fill_blocks(region_idx, bitmap);
        }
    }
}
