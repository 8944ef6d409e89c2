use parcompact::{
    base::constants::BYTES_PER_WORD,
    formatted_size,
    heap::{
        object_model::ObjectModel,
        sample::{allocate, ObjectShape, SampleHeap, SampleRoots, SpaceKind},
    },
    CompactArguments,
};
use rand::Rng;

/// Builds a random graph of binary nodes, drops most of it and compacts the rest.
fn main() {
    env_logger::init();

    let args = CompactArguments::from_env();
    let heap = match SampleHeap::new(&args, &[("perm", SpaceKind::Perm, 4), ("old", SpaceKind::Old, 256)]) {
        Ok(heap) => heap,
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(1);
        }
    };
    let mut ctx = match heap.collector(args) {
        Ok(ctx) => ctx,
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(1);
        }
    };
    let model = *ctx.model();
    let mut rng = rand::thread_rng();

    let class = allocate(&mut ctx, 0, ObjectShape::new(0, 0, 3)).unwrap_or(0);
    let node = ObjectShape::new(2, 0, 1).with_metadata();
    let mut nodes = Vec::new();
    while let Some(obj) = allocate(&mut ctx, 1, node) {
        unsafe {
            model.set_metadata(obj, class);
            model.set_payload(obj, 0, nodes.len());
            if !nodes.is_empty() {
                model.set_wide_ref(obj, 0, nodes[rng.gen_range(0..nodes.len())]);
                model.set_wide_ref(obj, 1, nodes[nodes.len() - 1]);
            }
        }
        nodes.push(obj);
    }

    if nodes.is_empty() {
        log::error!("old space cannot hold a single node");
        std::process::exit(1);
    }

    let mut roots = SampleRoots::new();
    for _ in 0..8 {
        roots.push_strong(nodes[rng.gen_range(0..nodes.len())]);
    }
    roots.push_weak(nodes[rng.gen_range(0..nodes.len())]);

    let summary = ctx.invoke(&mut roots, false);
    for space in &summary.spaces {
        log::info!(
            "{}: {} -> {} live, dense prefix at 0x{:x}",
            space.name,
            formatted_size(space.used_before_bytes()),
            formatted_size(space.live_bytes()),
            space.dense_prefix
        );
    }

    let mut objects = 0;
    let old = &ctx.spaces()[1];
    let mut addr = old.bottom();
    while addr < old.top() {
        unsafe {
            if !model.is_filler(addr) {
                objects += 1;
            }
            addr += model.object_size(addr) * BYTES_PER_WORD;
        }
    }
    println!(
        "allocated {} nodes, {} survived collection {} in {:.2} ms",
        nodes.len(),
        objects,
        summary.gc_number,
        summary.duration.as_micros() as f64 / 1000.0
    );
}
