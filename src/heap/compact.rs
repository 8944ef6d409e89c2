//! Parallel compaction.
//!
//! Destination regions are filled by workers that claim them once their destination count
//! drops to zero, i.e. once every region whose data would overwrite them has been copied
//! out. Filling a region copies live objects from its source regions, updates their
//! interior references and decrements the counts of the sources it consumed, which in turn
//! makes more regions available. Dense prefix regions are not moved; dedicated tasks walk
//! them to update references and turn dead gaps into filler objects.

use std::ptr;

use crossbeam_deque::{Injector, Steal, Worker};
use parking_lot::Mutex;
use scoped_thread_pool::Pool;

use crate::base::{constants::BYTES_PER_WORD, utils::pointer_delta};

use super::{
    dense_prefix::dead_space_crosses_boundary,
    heap::Heap,
    mark_bitmap::{IterationStatus, ParMarkBitmap, ParMarkBitmapClosure},
    object_model::ObjectModel,
    start_array::ObjectStartArray,
    taskqueue::{Terminator, WorkQueueSet},
};

/// A run of dense prefix regions `[region_beg, region_end)` of one space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UpdateDensePrefixTask {
    pub space_id: usize,
    pub region_beg: usize,
    pub region_end: usize,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct CompactStats {
    /// Destination regions filled by copying.
    pub regions_filled: usize,
    /// Words that actually changed address.
    pub words_copied: usize,
    pub dense_prefix_regions: usize,
    /// Objects whose interior update had to wait until every region was filled.
    pub deferred_objects: usize,
}

impl CompactStats {
    fn merge(&mut self, other: CompactStats) {
        self.regions_filled += other.regions_filled;
        self.words_copied += other.words_copied;
        self.dense_prefix_regions += other.dense_prefix_regions;
        self.deferred_objects += other.deferred_objects;
    }
}

/// Splits the dense prefix of every space into update tasks.
///
/// Small prefixes get one task per worker; larger ones are over-partitioned by
/// `tasks_per_thread` so that uneven tasks balance out. Whatever does not divide evenly
/// goes into a final task.
pub fn dense_prefix_tasks<M: ObjectModel>(
    heap: &Heap<M>,
    nworkers: usize,
    tasks_per_thread: usize,
) -> Vec<UpdateDensePrefixTask> {
    let sd = heap.summary();
    let mut tasks = Vec::new();

    for (space_id, space) in heap.spaces().iter().enumerate() {
        if space.dense_prefix() == space.bottom() {
            continue;
        }

        let end_region = sd.addr_to_region_idx(space.dense_prefix());
        let mut region_beg = sd.addr_to_region_idx(space.bottom());
        debug_assert!(
            space.dense_prefix() == space.end() || {
                let region = sd.region(end_region);
                region.available() || region.claimed()
            },
            "the region after the dense prefix must be ready to fill"
        );

        let total = end_region - region_beg;
        let over_partitioned = nworkers * tasks_per_thread.max(1);
        let ntasks = if total <= over_partitioned {
            nworkers
        } else {
            over_partitioned
        };
        let regions_per_task = (total / ntasks).max(1);

        for _ in 0..ntasks {
            if region_beg >= end_region {
                break;
            }

            let region_end = (region_beg + regions_per_task).min(end_region);
            tasks.push(UpdateDensePrefixTask {
                space_id,
                region_beg,
                region_end,
            });
            region_beg = region_end;
        }

        if region_beg < end_region {
            tasks.push(UpdateDensePrefixTask {
                space_id,
                region_beg,
                region_end: end_region,
            });
        }
    }

    tasks
}

/// Claims every destination region that can be filled right away and deals them out to
/// the workers round-robin, highest addresses first.
fn enqueue_region_draining_tasks<M: ObjectModel>(heap: &Heap<M>, workers: &[Worker<usize>]) -> usize {
    let sd = heap.summary();
    let mut which = 0;
    let mut count = 0;

    for space in heap.spaces().iter().rev() {
        let beg_region = sd.addr_to_region_idx(space.dense_prefix());
        let end_region = sd.addr_to_region_idx(sd.region_align_up(space.new_top()));

        for region_idx in (beg_region..end_region).rev() {
            let region = sd.region(region_idx);
            if region.claim_unsafe() {
                region.note_pushed();
                workers[which].push(region_idx);
                which = (which + 1) % workers.len();
                count += 1;
            }
        }
    }

    count
}

pub struct CompactionTask<'a, M: ObjectModel> {
    task_id: usize,
    worker: Worker<usize>,
    queues: &'a WorkQueueSet<usize>,
    dense_prefix_tasks: &'a Injector<UpdateDensePrefixTask>,
    terminator: &'a Terminator,
    heap: &'a Heap<M>,
    stats: CompactStats,
}

impl<'a, M: ObjectModel> CompactionTask<'a, M> {
    pub fn new(
        task_id: usize,
        worker: Worker<usize>,
        queues: &'a WorkQueueSet<usize>,
        dense_prefix_tasks: &'a Injector<UpdateDensePrefixTask>,
        terminator: &'a Terminator,
        heap: &'a Heap<M>,
    ) -> Self {
        Self {
            task_id,
            worker,
            queues,
            dense_prefix_tasks,
            terminator,
            heap,
            stats: CompactStats::default(),
        }
    }

    pub fn stats(&self) -> CompactStats {
        self.stats
    }

    pub fn run(&mut self) {
        loop {
            if let Some(region_idx) = self.worker.pop() {
                self.fill_region(region_idx);
            } else if let Some(task) = self.pop_dense_prefix_task() {
                self.update_and_deadwood_in_dense_prefix(task);
            } else if let Some(region_idx) = self.queues.steal(self.task_id, &self.worker) {
                self.fill_region(region_idx);
            } else if self.terminator.try_terminate() {
                break;
            }
        }
    }

    fn pop_dense_prefix_task(&self) -> Option<UpdateDensePrefixTask> {
        loop {
            match self.dense_prefix_tasks.steal() {
                Steal::Empty => return None,
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
            }
        }
    }

    fn push_region(&self, region_idx: usize) {
        self.heap.summary().region(region_idx).note_pushed();
        self.worker.push(region_idx);
    }

    fn space_id_of(&self, addr: usize) -> usize {
        match self.heap.space_id(addr) {
            Some(id) => id,
            None => panic!("address 0x{:x} is not in any space", addr),
        }
    }

    /// Fills the claimed destination region `region_idx` from its source regions.
    pub fn fill_region(&mut self, region_idx: usize) {
        let heap = self.heap;
        let sd = heap.summary();
        let bitmap = heap.bitmap();
        let region = sd.region(region_idx);

        let dest_addr = sd.region_to_addr(region_idx);
        let space = heap.space(self.space_id_of(dest_addr));
        let new_top = space.new_top();
        assert!(
            dest_addr < new_top,
            "region {} lies above the new top of {}",
            region_idx,
            space.name()
        );
        let words = pointer_delta(new_top, dest_addr).min(sd.options().region_size_words);
        let enqueue_end = sd.addr_to_region_idx(sd.region_align_up(new_top));
        let src_space_top = space.top();

        let mut src_region_idx = region.source_region();
        let mut closure = MoveAndUpdateClosure::new(heap, space.start_array(), dest_addr, words);
        closure.set_source(self.first_src_addr(dest_addr, src_region_idx));

        // A region copied into itself does not count itself as a destination.
        if src_region_idx == region_idx {
            src_region_idx += 1;
        }

        if bitmap.is_unmarked(closure.source) {
            // The first source word is inside an object whose head went elsewhere. Its
            // interior is updated when the head is processed.
            let old_src_addr = closure.source;
            closure.copy_partial_obj();
            if closure.is_full() {
                self.decrement_destination_counts(src_region_idx, closure.source, enqueue_end);
                self.finish_region(region_idx, 0, &closure);
                return;
            }

            let end_addr = sd.region_align_down(closure.source);
            if sd.region_align_down(old_src_addr) != end_addr {
                // The partial object came from more than one source region.
                self.decrement_destination_counts(src_region_idx, end_addr, enqueue_end);
                src_region_idx = self.next_src_region(&mut closure, src_space_top, end_addr);
            }
        }

        loop {
            let cur_addr = closure.source;
            let end_addr = sd.region_align_up(cur_addr + BYTES_PER_WORD).min(src_space_top);
            let mut status = bitmap.iterate(&mut closure, cur_addr, end_addr);

            if status == IterationStatus::Incomplete {
                // The last object starting in the source region ends beyond it.
                debug_assert!(closure.source < end_addr);
                let obj_beg = closure.source;
                let range_end = (obj_beg + closure.words_remaining * BYTES_PER_WORD).min(src_space_top);
                let obj_end = bitmap.find_obj_end_addr(obj_beg, range_end);
                if obj_end < range_end {
                    status = closure.do_addr(obj_beg, pointer_delta(obj_end, obj_beg) + 1);
                    debug_assert!(status != IterationStatus::WouldOverflow);
                } else {
                    assert!(range_end < src_space_top, "object at 0x{:x} crosses the space top", obj_beg);
                    status = IterationStatus::WouldOverflow;
                }
            }

            match status {
                IterationStatus::WouldOverflow => {
                    // Copy what fits; the interior is updated once the rest has landed.
                    let deferred = closure.destination;
                    closure.copy_until_full();
                    self.decrement_destination_counts(src_region_idx, closure.source, enqueue_end);
                    self.finish_region(region_idx, deferred, &closure);
                    return;
                }
                IterationStatus::Full => {
                    self.decrement_destination_counts(src_region_idx, closure.source, enqueue_end);
                    self.finish_region(region_idx, 0, &closure);
                    return;
                }
                _ => {}
            }

            self.decrement_destination_counts(src_region_idx, end_addr, enqueue_end);
            src_region_idx = self.next_src_region(&mut closure, src_space_top, end_addr);
        }
    }

    fn finish_region(&mut self, region_idx: usize, deferred: usize, closure: &MoveAndUpdateClosure<'_, M>) {
        let region = self.heap.summary().region(region_idx);
        region.set_deferred_obj_addr(deferred);
        region.set_completed();

        self.stats.regions_filled += 1;
        self.stats.words_copied += closure.words_copied;
    }

    /// Decrements the destination count of every source region in
    /// `[beg_region, region of end_addr]` and claims those that become available.
    fn decrement_destination_counts(&self, beg_region: usize, end_addr: usize, enqueue_end: usize) {
        let sd = self.heap.summary();
        let end_region = sd.addr_to_region_idx(sd.region_align_up(end_addr));

        for region_idx in beg_region..end_region {
            let region = sd.region(region_idx);
            debug_assert!(region.data_size() > 0, "region {} must have live data", region_idx);
            region.decrement_destination_count();
            if region_idx < enqueue_end && region.available() && region.claim() {
                self.push_region(region_idx);
            }
        }
    }

    /// Moves the closure to the next source region with data, at or after the region
    /// holding `end_addr`.
    fn next_src_region(
        &self,
        closure: &mut MoveAndUpdateClosure<'_, M>,
        src_space_top: usize,
        end_addr: usize,
    ) -> usize {
        let sd = self.heap.summary();
        let top_region = sd.addr_to_region_idx(sd.region_align_up(src_space_top));

        let mut src_region_idx = sd.addr_to_region_idx(sd.region_align_up(end_addr));
        while src_region_idx < top_region && sd.region(src_region_idx).data_size() == 0 {
            src_region_idx += 1;
        }

        assert!(
            src_region_idx < top_region,
            "no source region was found after 0x{:x}",
            end_addr
        );

        let src_region_addr = sd.region_to_addr(src_region_idx);
        if src_region_addr > closure.source {
            closure.set_source(src_region_addr);
        }
        src_region_idx
    }

    /// First word of `src_region_idx` that belongs at `dest_addr`.
    fn first_src_addr(&self, dest_addr: usize, src_region_idx: usize) -> usize {
        let sd = self.heap.summary();
        let bitmap = self.heap.bitmap();
        let src_region = sd.region(src_region_idx);
        let partial_obj_size = src_region.partial_obj_size();
        let src_region_destination = src_region.destination();

        assert!(dest_addr >= src_region_destination, "wrong source region {}", src_region_idx);
        assert!(src_region.data_size() > 0, "source region {} is empty", src_region_idx);

        let src_region_beg = sd.region_to_addr(src_region_idx);
        let src_region_end = src_region_beg + sd.options().region_size_bytes;

        if dest_addr == src_region_destination {
            if partial_obj_size == 0 {
                let addr = bitmap.find_obj_beg_addr(src_region_beg, src_region_end);
                assert!(addr < src_region_end, "no object starts in region {}", src_region_idx);
                return addr;
            }
            return src_region_beg;
        }

        let mut words_to_skip = pointer_delta(dest_addr, src_region_destination);
        assert!(src_region.data_size() > words_to_skip, "wrong source region {}", src_region_idx);

        if partial_obj_size >= words_to_skip {
            let addr = src_region_beg + words_to_skip * BYTES_PER_WORD;
            if partial_obj_size == words_to_skip {
                let addr = bitmap.find_obj_beg_addr(addr, src_region_end);
                assert!(addr < src_region_end, "wrong source region {}", src_region_idx);
                return addr;
            }
            return addr;
        }

        words_to_skip -= partial_obj_size;
        let addr = src_region_beg + partial_obj_size * BYTES_PER_WORD;
        let addr = skip_live_words(bitmap, addr, src_region_end, words_to_skip);
        assert!(addr < src_region_end, "wrong source region {}", src_region_idx);
        addr
    }

    /// Updates references in the dense prefix regions of `task` and fills their dead
    /// space.
    pub fn update_and_deadwood_in_dense_prefix(&mut self, task: UpdateDensePrefixTask) {
        let heap = self.heap;
        let sd = heap.summary();
        let bitmap = heap.bitmap();
        let space = heap.space(task.space_id);

        for region_idx in task.region_beg..task.region_end {
            assert!(
                sd.region(region_idx).claim(),
                "dense prefix region {} was already claimed",
                region_idx
            );
        }

        let mut beg_addr = sd.region_to_addr(task.region_beg);
        let end_addr = sd.region_to_addr(task.region_end);

        if beg_addr != space.bottom() {
            // An object or dead space reaching in from the left belongs to the task that
            // owns its start.
            let region = sd.region(task.region_beg);
            if region.partial_obj_size() != 0 {
                beg_addr = sd.partial_obj_end(task.region_beg);
            } else if dead_space_crosses_boundary(region, bitmap.addr_to_bit(beg_addr), bitmap) {
                beg_addr = bitmap.find_obj_beg_addr(beg_addr, end_addr);
            }
        }

        if beg_addr < end_addr {
            let mut update = UpdateOnlyClosure {
                heap,
                start_array: space.start_array(),
                source: beg_addr,
            };
            let mut fill = FillClosure {
                model: heap.model(),
                start_array: space.start_array(),
            };

            let status = bitmap.iterate_with_dead(&mut update, &mut fill, beg_addr, end_addr, space.dense_prefix());
            if status == IterationStatus::Incomplete {
                let source = update.source;
                update.update(source);
            }
        }

        for region_idx in task.region_beg..task.region_end {
            sd.region(region_idx).set_completed();
        }
        self.stats.dense_prefix_regions += task.region_end - task.region_beg;
    }
}

/// Address of the word `count` live words past `beg`, counting only objects that start
/// in `[beg, end)`. Landing just past an object yields the start of the next one.
fn skip_live_words(bitmap: &ParMarkBitmap, beg: usize, end: usize, count: usize) -> usize {
    assert!(count > 0);

    let end_bit = bitmap.addr_to_bit(end);
    let mut bits_to_skip = count;
    let mut cur_beg = bitmap.addr_to_bit(beg);

    loop {
        cur_beg = bitmap.find_obj_beg(cur_beg, end_bit);
        assert!(cur_beg < end_bit, "not enough live words to skip");
        let cur_end = bitmap.find_obj_end(cur_beg, bitmap.size());
        let obj_bits = ParMarkBitmap::obj_size(cur_beg, cur_end);
        if obj_bits > bits_to_skip {
            return bitmap.bit_to_addr(cur_beg + bits_to_skip);
        }

        bits_to_skip -= obj_bits;
        cur_beg = cur_end + 1;
        if bits_to_skip == 0 {
            break;
        }
    }

    cur_beg = bitmap.find_obj_beg(cur_beg, end_bit);
    assert!(cur_beg < end_bit, "not enough live words to skip");
    bitmap.bit_to_addr(cur_beg)
}

/// Copies objects into one destination region and updates their references.
struct MoveAndUpdateClosure<'a, M: ObjectModel> {
    heap: &'a Heap<M>,
    start_array: &'a ObjectStartArray,
    source: usize,
    destination: usize,
    words_remaining: usize,
    words_copied: usize,
}

impl<'a, M: ObjectModel> MoveAndUpdateClosure<'a, M> {
    fn new(heap: &'a Heap<M>, start_array: &'a ObjectStartArray, destination: usize, words: usize) -> Self {
        Self {
            heap,
            start_array,
            source: 0,
            destination,
            words_remaining: words,
            words_copied: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.words_remaining == 0
    }

    fn update_state(&mut self, words: usize) {
        self.words_remaining -= words;
        self.source += words * BYTES_PER_WORD;
        self.destination += words * BYTES_PER_WORD;
    }

    fn copy(&mut self, words: usize) {
        if self.source != self.destination {
            unsafe {
                ptr::copy(self.source as *const usize, self.destination as *mut usize, words);
            }
            self.words_copied += words;
        }
    }

    /// Copies the rest of the object the source points into, or as much of it as fits.
    fn copy_partial_obj(&mut self) {
        let bitmap = self.heap.bitmap();
        let mut words = self.words_remaining;

        let range_end = (self.source + words * BYTES_PER_WORD).min(bitmap.covered().end());
        let end_addr = bitmap.find_obj_end_addr(self.source, range_end);
        if end_addr < range_end {
            words = pointer_delta(end_addr, self.source) + 1;
        }

        // Skipping the copy keeps the updates made to a partial object that crosses the
        // dense prefix boundary.
        self.copy(words);
        self.update_state(words);
    }

    fn copy_until_full(&mut self) -> IterationStatus {
        let words = self.words_remaining;
        self.copy(words);
        self.update_state(words);
        IterationStatus::Full
    }
}

impl<'a, M: ObjectModel> ParMarkBitmapClosure for MoveAndUpdateClosure<'a, M> {
    fn do_addr(&mut self, addr: usize, words: usize) -> IterationStatus {
        self.source = addr;
        debug_assert_eq!(
            self.heap.calc_new_pointer(addr),
            self.destination,
            "wrong destination for 0x{:x}",
            addr
        );

        if words > self.words_remaining {
            return IterationStatus::WouldOverflow;
        }

        // Recorded even if the object does not move.
        self.start_array.allocate_block(self.destination);
        self.copy(words);
        unsafe {
            self.heap.update_contents(self.destination);
        }
        self.update_state(words);

        if self.is_full() {
            IterationStatus::Full
        } else {
            IterationStatus::Incomplete
        }
    }

    fn set_source(&mut self, addr: usize) {
        self.source = addr;
    }
}

struct UpdateOnlyClosure<'a, M: ObjectModel> {
    heap: &'a Heap<M>,
    start_array: &'a ObjectStartArray,
    source: usize,
}

impl<'a, M: ObjectModel> UpdateOnlyClosure<'a, M> {
    fn update(&self, addr: usize) {
        self.start_array.allocate_block(addr);
        unsafe {
            self.heap.update_contents(addr);
        }
    }
}

impl<'a, M: ObjectModel> ParMarkBitmapClosure for UpdateOnlyClosure<'a, M> {
    fn do_addr(&mut self, addr: usize, _words: usize) -> IterationStatus {
        self.update(addr);
        IterationStatus::Incomplete
    }

    fn set_source(&mut self, addr: usize) {
        self.source = addr;
    }
}

/// Turns dead space into filler objects and records their starts.
struct FillClosure<'a, M: ObjectModel> {
    model: &'a M,
    start_array: &'a ObjectStartArray,
}

impl<'a, M: ObjectModel> ParMarkBitmapClosure for FillClosure<'a, M> {
    fn do_addr(&mut self, addr: usize, words: usize) -> IterationStatus {
        let end = addr + words * BYTES_PER_WORD;
        unsafe {
            self.model.fill_with_dead(addr, words);
            let mut cur = addr;
            while cur < end {
                self.start_array.allocate_block(cur);
                cur += self.model.object_size(cur) * BYTES_PER_WORD;
            }
        }
        IterationStatus::Incomplete
    }

    fn set_source(&mut self, _addr: usize) {}
}

/// Updates the interiors of objects that were split across destination regions. Runs
/// once every region has been filled.
fn update_deferred_objects<M: ObjectModel>(heap: &Heap<M>) -> usize {
    let sd = heap.summary();
    let mut count = 0;

    for space in heap.spaces() {
        let beg_region = sd.addr_to_region_idx(space.dense_prefix());
        let end_region = sd.addr_to_region_idx(sd.region_align_up(space.new_top()));

        for region_idx in beg_region..end_region {
            let addr = sd.region(region_idx).deferred_obj_addr();
            if addr != 0 {
                space.start_array().allocate_block(addr);
                unsafe {
                    heap.update_contents(addr);
                }
                count += 1;
            }
        }
    }

    count
}

/// Compacts every space according to the summary. Every worker of `pool` runs exactly one
/// compaction task.
pub fn compact<M: ObjectModel>(
    heap: &Heap<M>,
    pool: &Pool,
    nworkers: usize,
    dense_prefix_tasks_per_thread: usize,
) -> CompactStats {
    let (queues, workers) = WorkQueueSet::new(nworkers);

    let dense_prefix = Injector::new();
    let tasks = dense_prefix_tasks(heap, nworkers, dense_prefix_tasks_per_thread);
    let ntasks = tasks.len();
    for task in tasks {
        dense_prefix.push(task);
    }

    let nregions = enqueue_region_draining_tasks(heap, &workers);
    log::debug!(
        target: "gc-compact",
        "{} dense prefix tasks, {} initial region draining tasks on {} workers",
        ntasks,
        nregions,
        nworkers
    );

    let total = Mutex::new(CompactStats::default());
    let terminator = Terminator::new(nworkers);

    // blocking call, waits for every compaction task to complete.
    pool.scoped(|scope| {
        for (task_id, worker) in workers.into_iter().enumerate() {
            let queues = &queues;
            let dense_prefix = &dense_prefix;
            let terminator = &terminator;
            let total = &total;

            scope.execute(move || {
                let mut task = CompactionTask::new(task_id, worker, queues, dense_prefix, terminator, heap);
                task.run();
                total.lock().merge(task.stats());
            });
        }
    });

    let mut stats = total.into_inner();
    stats.deferred_objects = update_deferred_objects(heap);
    stats
}
