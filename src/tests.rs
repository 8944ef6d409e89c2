use std::collections::{HashMap, HashSet};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    base::{constants::BYTES_PER_WORD, memory_region::MemoryRegion},
    heap::{
        arguments::{CompactArguments, SpaceConfig},
        collector::{CollectionSummary, CollectorContext},
        error::CollectorError,
        object_model::ObjectModel,
        refs::Ref,
        sample::{allocate, ObjectShape, SampleHeap, SampleObjectModel, SampleRoots, SpaceKind},
    },
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn args(threads: usize) -> CompactArguments {
    CompactArguments {
        parallel_gc_threads: threads,
        log2_region_words: 10,
        log2_block_words: 7,
        verify: true,
        ..Default::default()
    }
}

struct World {
    ctx: CollectorContext<SampleObjectModel>,
    roots: SampleRoots,
    _heap: SampleHeap,
}

impl World {
    fn new(args: CompactArguments, layout: &[(&'static str, SpaceKind, usize)]) -> Self {
        init_logging();
        let heap = SampleHeap::new(&args, layout).unwrap();
        let ctx = heap.collector(args).unwrap();

        Self {
            ctx,
            roots: SampleRoots::new(),
            _heap: heap,
        }
    }

    fn model(&self) -> SampleObjectModel {
        *self.ctx.model()
    }

    fn bottom(&self, space_id: usize) -> usize {
        self.ctx.spaces()[space_id].bottom()
    }

    fn region_bytes(&self) -> usize {
        self.ctx.options().region_size_bytes
    }

    fn alloc(&mut self, space_id: usize, shape: ObjectShape) -> usize {
        allocate(&mut self.ctx, space_id, shape).expect("space is full")
    }

    /// Fills the space up to `addr` with one unreachable object.
    fn pad_to(&mut self, space_id: usize, addr: usize) {
        let top = self.ctx.top(space_id);
        assert!(addr >= top);
        let words = (addr - top) / BYTES_PER_WORD;
        if words > 0 {
            self.alloc(space_id, ObjectShape::new(0, 0, words - 1));
        }
        assert_eq!(self.ctx.top(space_id), addr);
    }

    fn collect(&mut self, maximum_compaction: bool) -> CollectionSummary {
        self.ctx.invoke(&mut self.roots, maximum_compaction)
    }
}

#[test]
fn test_live_regions_slide_to_bottom() {
    let mut w = World::new(args(4), &[("old", SpaceKind::Old, 8)]);
    let model = w.model();
    let bottom = w.bottom(0);
    let shape = ObjectShape::new(2, 0, 5);
    let size = shape.size_in_words() * BYTES_PER_WORD;

    let mut live = Vec::new();
    for region in [0usize, 3, 7] {
        w.pad_to(0, bottom + region * w.region_bytes());
        for _ in 0..20 {
            live.push(w.alloc(0, shape));
            let dead = w.alloc(0, shape);
            unsafe {
                model.set_wide_ref(dead, 0, live[0]);
            }
        }
    }

    let n = live.len();
    unsafe {
        for (i, &obj) in live.iter().enumerate() {
            model.set_payload(obj, 0, i);
            model.set_wide_ref(obj, 0, live[(i + 1) % n]);
            model.set_wide_ref(obj, 1, live[(i + n - 1) % n]);
        }
    }
    w.roots.push_strong(live[0]);
    let old_top = w.ctx.top(0);

    let summary = w.collect(true);
    assert!(summary.maximum_compaction);
    assert_eq!(summary.live_objects, n);
    assert_eq!(summary.spaces[0].live_words, n * shape.size_in_words());
    assert_eq!(summary.spaces[0].used_before_words, (old_top - bottom) / BYTES_PER_WORD);
    assert_eq!(summary.spaces[0].used_before_bytes(), old_top - bottom);
    assert_eq!(summary.spaces[0].live_bytes(), n * size);
    assert_eq!(summary.spaces[0].dense_prefix, bottom);
    assert_eq!(summary.spaces[0].new_top, bottom + n * size);
    assert_eq!(w.ctx.top(0), bottom + n * size);
    assert_eq!(w.roots.strong[0].decode(), bottom);

    unsafe {
        for (i, &old) in live.iter().enumerate() {
            let new = bottom + i * size;
            assert_eq!(model.payload(new, 0), i);
            assert_eq!(model.wide_ref(new, 0), bottom + (i + 1) % n * size);
            assert_eq!(model.wide_ref(new, 1), bottom + (i + n - 1) % n * size);
            assert_eq!(w.ctx.calc_new_pointer(old), new);
            assert_eq!(w.ctx.calc_new_pointer(old + 3 * BYTES_PER_WORD), new + 3 * BYTES_PER_WORD);
            assert_eq!(w.ctx.object_start(new + 5 * BYTES_PER_WORD), Some(new));
        }
    }

    unsafe {
        assert_eq!(w.ctx.object_start(bottom), Some(bottom));
        assert_eq!(w.ctx.object_start(bottom + size), Some(bottom + size));
    }

    // A second cycle marks the compacted objects where they now are and moves nothing.
    let summary = w.collect(true);
    assert_eq!(summary.compact.words_copied, 0);
    assert_eq!(summary.spaces[0].new_top, bottom + n * size);

    let rescanned: Vec<_> = w
        .ctx
        .heap()
        .bitmap()
        .live_objects(bottom, w.ctx.top(0))
        .collect();
    assert_eq!(rescanned.len(), n);
    for (i, &(addr, words)) in rescanned.iter().enumerate() {
        assert_eq!(addr, bottom + i * size);
        assert_eq!(words, shape.size_in_words());
    }
}

#[test]
fn test_straddling_object_is_forwarded_as_one_range() {
    let mut w = World::new(args(2), &[("old", SpaceKind::Old, 8)]);
    let model = w.model();
    let bottom = w.bottom(0);

    let small = w.alloc(0, ObjectShape::new(0, 0, 7));
    let region_3 = bottom + 3 * w.region_bytes();
    w.pad_to(0, region_3 - 25 * BYTES_PER_WORD);

    let big = w.alloc(0, ObjectShape::new(0, 0, 49));
    unsafe {
        assert_eq!(model.object_size(big), 50);
        model.set_payload(small, 0, 1);
        for k in 0..49 {
            model.set_payload(big, k, k * 3);
        }
    }
    w.alloc(0, ObjectShape::new(0, 0, 100));
    w.roots.push_strong(small);
    w.roots.push_strong(big);

    w.collect(true);

    let sd = w.ctx.heap().summary();
    assert_eq!(sd.addr_to_region(region_3).partial_obj_size(), 25);
    assert_eq!(sd.addr_to_region(region_3).partial_obj_addr(), big);

    let new_big = bottom + 8 * BYTES_PER_WORD;
    assert_eq!(w.roots.strong[1].decode(), new_big);
    for k in 0..50 {
        assert_eq!(
            w.ctx.calc_new_pointer(big + k * BYTES_PER_WORD),
            new_big + k * BYTES_PER_WORD,
            "word {}",
            k
        );
    }
    unsafe {
        assert_eq!(model.payload(bottom, 0), 1);
        for k in 0..49 {
            assert_eq!(model.payload(new_big, k), k * 3);
        }
    }
}

#[test]
fn test_dense_prefix_stays_in_place() {
    let mut w = World::new(args(4), &[("old", SpaceKind::Old, 8)]);
    let model = w.model();
    let bottom = w.bottom(0);
    let shape = ObjectShape::new(1, 0, 14);
    assert_eq!(shape.size_in_words(), 16);

    let mut live = Vec::new();
    // Regions 0 and 1 completely live.
    for _ in 0..128 {
        live.push(w.alloc(0, shape));
    }
    // Region 2 half dead.
    for _ in 0..32 {
        live.push(w.alloc(0, shape));
        w.alloc(0, shape);
    }
    w.pad_to(0, bottom + 4 * w.region_bytes());
    for _ in 0..10 {
        live.push(w.alloc(0, shape));
        w.alloc(0, ObjectShape::new(0, 0, 40));
    }

    unsafe {
        for (i, &obj) in live.iter().enumerate() {
            model.set_payload(obj, 0, i);
            if i > 0 {
                model.set_wide_ref(obj, 0, live[i - 1]);
            }
        }
    }
    w.roots.push_strong(live[live.len() - 1]);

    let summary = w.collect(false);
    assert!(!summary.maximum_compaction);

    let dense_prefix = summary.spaces[0].dense_prefix;
    assert!(dense_prefix >= bottom + 2 * w.region_bytes());
    assert_eq!((dense_prefix - bottom) % w.region_bytes(), 0);
    assert!(dense_prefix <= summary.spaces[0].new_top);

    let mut moved_words = 0;
    for &old in &live {
        let new = w.ctx.calc_new_pointer(old);
        if old < dense_prefix {
            assert_eq!(new, old);
        } else {
            moved_words += shape.size_in_words();
        }
    }
    assert_eq!(summary.spaces[0].new_top, dense_prefix + moved_words * BYTES_PER_WORD);

    unsafe {
        let mut obj = w.roots.strong[0].decode();
        for i in (0..live.len()).rev() {
            assert_eq!(model.payload(obj, 0), i);
            assert_eq!(obj, w.ctx.calc_new_pointer(live[i]));
            obj = model.wide_ref(obj, 0);
        }
        assert_eq!(obj, 0);
    }
}

#[test]
fn test_weak_roots_are_cleared_or_forwarded() {
    let mut w = World::new(args(2), &[("old", SpaceKind::Old, 4)]);
    let model = w.model();

    let garbage = w.alloc(0, ObjectShape::new(0, 0, 30));
    let weakly_reachable = w.alloc(0, ObjectShape::new(0, 0, 1));
    let strong = w.alloc(0, ObjectShape::new(0, 0, 1));
    unsafe {
        model.set_payload(strong, 0, 42);
    }
    let _ = garbage;

    w.roots.push_strong(strong);
    w.roots.push_weak(weakly_reachable);
    w.roots.push_weak(strong);
    w.roots.weak.push(Ref::NULL);

    let summary = w.collect(true);
    assert_eq!(summary.weak_roots_cleared, 1);
    assert!(w.roots.weak[0].is_null());
    assert_eq!(w.roots.weak[1], w.roots.strong[0]);
    assert!(w.roots.weak[2].is_null());
    assert_eq!(w.roots.strong[0].decode(), w.bottom(0));
    unsafe {
        assert_eq!(model.payload(w.bottom(0), 0), 42);
    }
}

#[test]
fn test_interior_weak_roots_follow_their_object() {
    let mut w = World::new(args(2), &[("old", SpaceKind::Old, 4)]);
    let model = w.model();

    let garbage = w.alloc(0, ObjectShape::new(0, 0, 30));
    let strong = w.alloc(0, ObjectShape::new(0, 0, 6));
    unsafe {
        model.set_payload(strong, 3, 99);
    }

    w.roots.push_strong(strong);
    w.roots.push_weak(strong + 4 * BYTES_PER_WORD);
    w.roots.push_weak(garbage + 5 * BYTES_PER_WORD);

    let summary = w.collect(true);
    let bottom = w.bottom(0);
    assert_eq!(summary.weak_roots_cleared, 1);
    assert_eq!(w.roots.weak[0].decode(), bottom + 4 * BYTES_PER_WORD);
    assert!(w.roots.weak[1].is_null());
    // Liveness is answered for the addresses of the last cycle.
    assert!(w.ctx.heap().is_live_word(strong + 6 * BYTES_PER_WORD));
    assert!(!w.ctx.heap().is_live_word(strong + 7 * BYTES_PER_WORD));
    assert!(!w.ctx.heap().is_live_word(garbage + BYTES_PER_WORD));
    unsafe {
        assert_eq!((w.roots.weak[0].decode() as *const usize).read(), 99);
    }
}

static EXTERNAL_METADATA: usize = 0;

#[test]
fn test_narrow_and_metadata_references() {
    let mut w = World::new(
        args(3),
        &[("perm", SpaceKind::Perm, 1), ("old", SpaceKind::Old, 2)],
    );
    let model = w.model();
    let external = &EXTERNAL_METADATA as *const usize as usize;

    w.alloc(0, ObjectShape::new(0, 0, 9));
    let meta = w.alloc(0, ObjectShape::new(0, 0, 1));

    w.alloc(1, ObjectShape::new(0, 0, 20));
    let shape = ObjectShape::new(0, 2, 1).with_metadata();
    let a = w.alloc(1, shape);
    w.alloc(1, ObjectShape::new(0, 0, 3));
    let b = w.alloc(1, shape);
    let c = w.alloc(1, ObjectShape::new(0, 0, 1).with_metadata());

    unsafe {
        model.set_payload(meta, 0, 777);
        model.set_payload(a, 0, 1);
        model.set_payload(b, 0, 2);
        model.set_payload(c, 0, 3);
        model.set_metadata(a, meta);
        model.set_metadata(b, meta);
        model.set_metadata(c, external);
        model.set_narrow_ref(a, 0, b);
        model.set_narrow_ref(a, 1, c);
        model.set_narrow_ref(b, 0, a);
    }
    w.roots.push_strong(a);

    let summary = w.collect(true);
    assert_eq!(summary.live_objects, 4);

    let perm = w.bottom(0);
    let old = w.bottom(1);
    let size = shape.size_in_words() * BYTES_PER_WORD;
    unsafe {
        assert_eq!(model.payload(perm, 0), 777);
        assert_eq!(w.roots.strong[0].decode(), old);

        let (a, b, c) = (old, old + size, old + 2 * size);
        assert_eq!(model.payload(a, 0), 1);
        assert_eq!(model.payload(b, 0), 2);
        assert_eq!(model.payload(c, 0), 3);
        assert_eq!(model.metadata(a), perm);
        assert_eq!(model.metadata(b), perm);
        assert_eq!(model.metadata(c), external);
        assert_eq!(model.narrow_ref(a, 0), b);
        assert_eq!(model.narrow_ref(a, 1), c);
        assert_eq!(model.narrow_ref(b, 0), a);
        assert_eq!(model.narrow_ref(b, 1), 0);
    }
}

#[test]
fn test_maximum_compaction_policy() {
    let mut w = World::new(args(1), &[("old", SpaceKind::Old, 2)]);
    let obj = w.alloc(0, ObjectShape::new(0, 0, 3));
    w.roots.push_strong(obj);

    assert!(!w.collect(false).maximum_compaction);
    assert!(!w.collect(false).maximum_compaction);
    // The third collection is always a maximum compaction.
    assert!(w.collect(false).maximum_compaction);
    assert!(!w.collect(false).maximum_compaction);
    assert!(w.collect(true).maximum_compaction);
    assert_eq!(w.ctx.total_invocations(), 5);

    let mut w = World::new(
        CompactArguments {
            use_dense_prefix: false,
            ..args(1)
        },
        &[("old", SpaceKind::Old, 2)],
    );
    assert!(w.collect(false).maximum_compaction);
}

#[test]
fn test_rejects_misaligned_space() {
    init_logging();
    let args = args(1);
    let heap = SampleHeap::new(&args, &[("old", SpaceKind::Old, 2)]).unwrap();
    let covered = heap.covered();

    let misaligned = SpaceConfig::old("old", covered.start() + BYTES_PER_WORD, covered.end());
    let result = CollectorContext::new(args.clone(), covered, vec![misaligned], heap.model());
    assert!(matches!(result, Err(CollectorError::InvalidConfiguration(_))));

    let outside = SpaceConfig::old("old", covered.start(), covered.end() + heap_region(&args));
    let result = CollectorContext::new(args.clone(), covered, vec![outside], heap.model());
    assert!(matches!(result, Err(CollectorError::InvalidConfiguration(_))));

    let result = CollectorContext::new(args, covered, Vec::new(), heap.model());
    assert!(matches!(result, Err(CollectorError::InvalidConfiguration(_))));
}

fn heap_region(args: &CompactArguments) -> usize {
    (1 << args.log2_region_words) * BYTES_PER_WORD
}

#[test]
fn test_metadata_reservation_failure_is_reported() {
    init_logging();
    let args = args(1);
    let start = 1usize << 32;
    let covered = MemoryRegion::new(start, 1 << 60);
    let space = SpaceConfig::old("old", start, start + heap_region(&args));

    match CollectorContext::new(args, covered, vec![space], SampleObjectModel::new(covered)) {
        Err(err @ CollectorError::MetadataReservation { .. }) => {
            assert!(err.to_string().contains("collector unavailable"));
        }
        Err(err) => panic!("unexpected error: {}", err),
        Ok(_) => panic!("reserving metadata for 1 EiB should fail"),
    }
}

struct Node {
    addr: usize,
    refs: [Option<usize>; 2],
}

#[test]
fn test_random_graphs_survive_repeated_collections() {
    let args = CompactArguments {
        parallel_gc_threads: 8,
        log2_region_words: 6,
        log2_block_words: 4,
        verify: true,
        ..Default::default()
    };
    let mut w = World::new(args, &[("old", SpaceKind::Old, 64), ("old2", SpaceKind::Old, 32)]);
    let model = w.model();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut nodes: HashMap<usize, Node> = HashMap::new();
    let mut next_id = 0;

    for round in 0..8 {
        // Allocate a fresh batch; references point at survivors and at the batch itself.
        for space_id in 0..2 {
            for _ in 0..40 {
                let shape = ObjectShape::new(2, 0, rng.gen_range(1..100));
                let addr = match allocate(&mut w.ctx, space_id, shape) {
                    Some(addr) => addr,
                    None => break,
                };
                unsafe {
                    model.set_payload(addr, 0, next_id);
                }
                nodes.insert(
                    next_id,
                    Node {
                        addr,
                        refs: [None, None],
                    },
                );
                next_id += 1;
            }
        }

        let ids: Vec<usize> = nodes.keys().copied().collect();
        for id in &ids {
            let mut refs = [None, None];
            for slot in refs.iter_mut() {
                if rng.gen_bool(0.6) {
                    *slot = Some(ids[rng.gen_range(0..ids.len())]);
                }
            }
            nodes.get_mut(id).unwrap().refs = refs;
        }
        for id in &ids {
            let node = &nodes[id];
            unsafe {
                for (index, target) in node.refs.iter().enumerate() {
                    let target = target.map(|t| nodes[&t].addr).unwrap_or(0);
                    model.set_wide_ref(node.addr, index, target);
                }
            }
        }

        let strong: Vec<usize> = ids.iter().copied().filter(|_| rng.gen_bool(0.1)).collect();
        let weak: Vec<usize> = ids.iter().copied().filter(|_| rng.gen_bool(0.05)).collect();
        w.roots.strong = strong.iter().map(|id| Ref::encode(nodes[id].addr)).collect();
        w.roots.weak = weak.iter().map(|id| Ref::encode(nodes[id].addr)).collect();

        let mut reachable = HashSet::new();
        let mut stack = strong.clone();
        while let Some(id) = stack.pop() {
            if reachable.insert(id) {
                stack.extend(nodes[&id].refs.iter().flatten().copied());
            }
        }

        let summary = w.collect(rng.gen_bool(0.3));
        assert_eq!(summary.live_objects, reachable.len(), "round {}", round);

        // Every surviving object is found by walking the spaces.
        let mut found = HashMap::new();
        for space in w.ctx.spaces() {
            let mut addr = space.bottom();
            while addr < space.top() {
                unsafe {
                    if !model.is_filler(addr) {
                        assert!(found.insert(model.payload(addr, 0), addr).is_none());
                    }
                    addr += model.object_size(addr) * BYTES_PER_WORD;
                }
            }
            assert_eq!(addr, space.top());
        }
        let found_ids: HashSet<usize> = found.keys().copied().collect();
        assert_eq!(found_ids, reachable, "round {}", round);

        nodes.retain(|id, _| reachable.contains(id));
        for (id, node) in nodes.iter_mut() {
            assert_eq!(w.ctx.calc_new_pointer(node.addr), found[id]);
            node.addr = found[id];
        }

        unsafe {
            for node in nodes.values() {
                for (index, target) in node.refs.iter().enumerate() {
                    let expected = target.map(|t| nodes[&t].addr).unwrap_or(0);
                    assert_eq!(model.wide_ref(node.addr, index), expected, "round {}", round);
                }
            }
        }

        for (root, id) in w.roots.strong.iter().zip(&strong) {
            assert_eq!(root.decode(), nodes[id].addr);
        }
        for (root, id) in w.roots.weak.iter().zip(&weak) {
            match nodes.get(id) {
                Some(node) => assert_eq!(root.decode(), node.addr),
                None => assert!(root.is_null()),
            }
        }
    }
}
