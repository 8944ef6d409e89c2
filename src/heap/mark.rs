use crossbeam_deque::Worker;
use parking_lot::Mutex;
use scoped_thread_pool::Pool;

use super::{
    heap::Heap,
    object_model::{ObjectModel, RootSet},
    refs::{PointerVisitor, Slot},
    taskqueue::{Terminator, WorkQueueSet},
};

type Address = usize;

/// Objects and words marked during one marking phase.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct MarkStats {
    pub objects: usize,
    pub words: usize,
}

impl MarkStats {
    fn merge(&mut self, other: MarkStats) {
        self.objects += other.objects;
        self.words += other.words;
    }
}

pub struct MarkingTask<'a, M: ObjectModel> {
    task_id: usize,
    local: Segment,
    worker: Worker<Address>,
    queues: &'a WorkQueueSet<Address>,
    terminator: &'a Terminator,
    marked: usize,
    stats: MarkStats,
    heap: &'a Heap<M>,
}

impl<'a, M: ObjectModel> MarkingTask<'a, M> {
    pub fn new(
        task_id: usize,
        worker: Worker<Address>,
        queues: &'a WorkQueueSet<Address>,
        terminator: &'a Terminator,
        heap: &'a Heap<M>,
    ) -> Self {
        Self {
            task_id,
            local: Segment::new(),
            worker,
            queues,
            terminator,
            marked: 0,
            stats: MarkStats::default(),
            heap,
        }
    }

    pub fn stats(&self) -> MarkStats {
        self.stats
    }

    pub fn pop(&mut self) -> Option<Address> {
        self.local
            .pop()
            .or_else(|| self.worker.pop())
            .or_else(|| self.queues.pop_global(&self.worker))
            .or_else(|| self.queues.steal(self.task_id, &self.worker))
    }

    /// Hands half of a busy local segment to the injector so idle workers get something
    /// to steal.
    fn defensive_push(&mut self) {
        self.marked += 1;

        if self.marked > 256 {
            if self.local.len() > 4 {
                let target_len = self.local.len() / 2;

                while self.local.len() > target_len {
                    match self.local.pop() {
                        Some(val) => self.queues.push_global(val),
                        None => break,
                    }
                }
            }

            self.marked = 0;
        }
    }

    pub fn run(&mut self) {
        loop {
            let object = if let Some(addr) = self.pop() {
                addr
            } else if self.terminator.try_terminate() {
                break;
            } else {
                continue;
            };

            unsafe {
                self.scan(object);
            }
        }
    }

    unsafe fn scan(&mut self, obj: Address) {
        let heap = self.heap;
        heap.model().visit_references(obj, self);

        if let Some(slot) = heap.model().metadata_slot(obj) {
            self.visit(slot);
        }
    }

    fn push(&mut self, obj: Address) {
        if self.local.has_capacity() {
            self.local.push(obj);
            self.defensive_push();
        } else {
            self.worker.push(obj);
        }
    }

    unsafe fn try_mark(&mut self, obj: Address) {
        if !self.heap.is_in_space(obj) {
            return;
        }

        let words = self.heap.model().object_size(obj);
        if self.heap.bitmap().mark(obj, words) {
            self.stats.objects += 1;
            self.stats.words += words;
            self.push(obj);
        }
    }
}

impl<'a, M: ObjectModel> PointerVisitor for MarkingTask<'a, M> {
    fn visit(&mut self, slot: Slot) {
        unsafe {
            let r = slot.load();
            if !r.is_null() {
                self.try_mark(r.decode());
            }
        }
    }
}

/// Marks the strong roots on the calling thread and seeds the injector with them.
struct RootMarker<'a, M: ObjectModel> {
    heap: &'a Heap<M>,
    queues: &'a WorkQueueSet<Address>,
    stats: MarkStats,
}

impl<'a, M: ObjectModel> PointerVisitor for RootMarker<'a, M> {
    fn visit(&mut self, slot: Slot) {
        unsafe {
            let r = slot.load();
            if r.is_null() || !self.heap.is_in_space(r.decode()) {
                return;
            }

            let obj = r.decode();
            let words = self.heap.model().object_size(obj);
            if self.heap.bitmap().mark(obj, words) {
                self.stats.objects += 1;
                self.stats.words += words;
                self.queues.push_global(obj);
            }
        }
    }
}

const SEGMENT_SIZE: usize = 64;

struct Segment {
    data: Vec<Address>,
}

impl Segment {
    fn new() -> Segment {
        Segment {
            data: Vec::with_capacity(SEGMENT_SIZE),
        }
    }

    fn has_capacity(&self) -> bool {
        self.data.len() < SEGMENT_SIZE
    }

    fn push(&mut self, addr: Address) {
        debug_assert!(self.has_capacity());
        self.data.push(addr);
    }

    fn pop(&mut self) -> Option<Address> {
        self.data.pop()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Parallel marking from `roots`. Weak roots are not traced.
///
/// Every worker of `pool` runs exactly one marking task, so the terminator sees the whole
/// group.
pub fn mark_live_objects<M: ObjectModel>(
    heap: &Heap<M>,
    pool: &Pool,
    nworkers: usize,
    roots: &mut dyn RootSet,
) -> MarkStats {
    let (queues, workers) = WorkQueueSet::new(nworkers);

    let mut root_marker = RootMarker {
        heap,
        queues: &queues,
        stats: MarkStats::default(),
    };
    roots.roots_do(&mut root_marker);

    let total = Mutex::new(root_marker.stats);
    let terminator = Terminator::new(nworkers);

    // blocking call, waits for every marking task to complete.
    pool.scoped(|scope| {
        for (task_id, worker) in workers.into_iter().enumerate() {
            let queues = &queues;
            let terminator = &terminator;
            let total = &total;

            scope.execute(move || {
                let mut task = MarkingTask::new(task_id, worker, queues, terminator, heap);
                task.run();
                total.lock().merge(task.stats());
            });
        }
    });

    debug_assert!(queues.is_empty());
    total.into_inner()
}
