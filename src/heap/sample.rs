//! A self-describing object layout for the demo binary and the tests.
//!
//! Every object starts with a header word:
//!
//! ```text
//!  63            16 15      10 9        4 3     0
//! +----------------+----------+----------+-------+
//! | size in words  |  narrow  |   wide   | flags |
//! +----------------+----------+----------+-------+
//! ```
//!
//! followed by the metadata reference (if [`HAS_METADATA`] is set), the wide references,
//! the narrow references packed two per word and finally the payload words.

use crate::base::{
    constants::BYTES_PER_WORD,
    memory_region::MemoryRegion,
    virtual_memory::VirtualMemory,
};

use super::{
    arguments::{CompactArguments, SpaceConfig},
    collector::CollectorContext,
    error::CollectorError,
    object_model::{ObjectModel, RootSet},
    refs::{CompressedRefs, NarrowRef, PointerVisitor, Ref, Slot},
};

pub const FILLER: usize = 1;
pub const HAS_METADATA: usize = 2;

const WIDE_SHIFT: usize = 4;
const NARROW_SHIFT: usize = 10;
const SIZE_SHIFT: usize = 16;
const COUNT_MASK: usize = (1 << 6) - 1;

/// Largest number of references of either kind an object can have.
pub const MAX_REFS: usize = COUNT_MASK;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct ObjectShape {
    pub wide_refs: usize,
    pub narrow_refs: usize,
    pub payload_words: usize,
    pub metadata: bool,
}

impl ObjectShape {
    pub const fn new(wide_refs: usize, narrow_refs: usize, payload_words: usize) -> Self {
        Self {
            wide_refs,
            narrow_refs,
            payload_words,
            metadata: false,
        }
    }

    pub const fn with_metadata(mut self) -> Self {
        self.metadata = true;
        self
    }

    pub const fn size_in_words(&self) -> usize {
        1 + self.metadata as usize + self.wide_refs + (self.narrow_refs + 1) / 2 + self.payload_words
    }

    fn header(&self) -> usize {
        assert!(
            self.wide_refs <= MAX_REFS && self.narrow_refs <= MAX_REFS,
            "too many references: {:?}",
            self
        );
        let flags = if self.metadata { HAS_METADATA } else { 0 };
        flags
            | (self.wide_refs << WIDE_SHIFT)
            | (self.narrow_refs << NARROW_SHIFT)
            | (self.size_in_words() << SIZE_SHIFT)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SampleObjectModel {
    codec: CompressedRefs,
}

impl SampleObjectModel {
    pub fn new(covered: MemoryRegion) -> Self {
        Self {
            codec: CompressedRefs::for_heap(covered.start()),
        }
    }

    pub fn codec(&self) -> CompressedRefs {
        self.codec
    }

    #[inline]
    unsafe fn header(&self, obj: usize) -> usize {
        (obj as *const usize).read()
    }

    pub unsafe fn is_filler(&self, obj: usize) -> bool {
        self.header(obj) & FILLER != 0
    }

    pub unsafe fn shape(&self, obj: usize) -> ObjectShape {
        let header = self.header(obj);
        let wide_refs = (header >> WIDE_SHIFT) & COUNT_MASK;
        let narrow_refs = (header >> NARROW_SHIFT) & COUNT_MASK;
        let metadata = header & HAS_METADATA != 0;
        let fixed = 1 + metadata as usize + wide_refs + (narrow_refs + 1) / 2;

        ObjectShape {
            wide_refs,
            narrow_refs,
            payload_words: (header >> SIZE_SHIFT) - fixed,
            metadata,
        }
    }

    /// Writes the header of a fresh object of `shape` at `addr` and zeroes its body.
    pub unsafe fn initialize(&self, addr: usize, shape: ObjectShape) {
        let words = shape.size_in_words();
        let object = addr as *mut usize;
        object.write(shape.header());
        std::ptr::write_bytes(object.add(1), 0, words - 1);
    }

    unsafe fn wide_base(&self, obj: usize) -> usize {
        let metadata = self.header(obj) & HAS_METADATA != 0;
        obj + (1 + metadata as usize) * BYTES_PER_WORD
    }

    unsafe fn narrow_base(&self, obj: usize) -> usize {
        self.wide_base(obj) + self.shape(obj).wide_refs * BYTES_PER_WORD
    }

    pub unsafe fn wide_slot(&self, obj: usize, index: usize) -> *mut Ref {
        assert!(index < self.shape(obj).wide_refs, "wide reference {} out of bounds", index);
        (self.wide_base(obj) as *mut Ref).add(index)
    }

    pub unsafe fn narrow_slot(&self, obj: usize, index: usize) -> *mut NarrowRef {
        assert!(index < self.shape(obj).narrow_refs, "narrow reference {} out of bounds", index);
        (self.narrow_base(obj) as *mut NarrowRef).add(index)
    }

    pub unsafe fn payload_slot(&self, obj: usize, index: usize) -> *mut usize {
        let shape = self.shape(obj);
        assert!(index < shape.payload_words, "payload word {} out of bounds", index);
        let payload = self.narrow_base(obj) + (shape.narrow_refs + 1) / 2 * BYTES_PER_WORD;
        (payload as *mut usize).add(index)
    }

    pub unsafe fn wide_ref(&self, obj: usize, index: usize) -> usize {
        self.wide_slot(obj, index).read().decode()
    }

    pub unsafe fn set_wide_ref(&self, obj: usize, index: usize, target: usize) {
        self.wide_slot(obj, index).write(Ref::encode(target));
    }

    pub unsafe fn narrow_ref(&self, obj: usize, index: usize) -> usize {
        self.codec.decode(self.narrow_slot(obj, index).read()).decode()
    }

    pub unsafe fn set_narrow_ref(&self, obj: usize, index: usize, target: usize) {
        self.narrow_slot(obj, index).write(self.codec.encode(Ref::encode(target)));
    }

    pub unsafe fn metadata(&self, obj: usize) -> usize {
        match self.metadata_slot(obj) {
            Some(slot) => slot.load().decode(),
            None => 0,
        }
    }

    pub unsafe fn set_metadata(&self, obj: usize, target: usize) {
        match self.metadata_slot(obj) {
            Some(slot) => slot.store(Ref::encode(target)),
            None => panic!("object at 0x{:x} has no metadata slot", obj),
        }
    }

    pub unsafe fn payload(&self, obj: usize, index: usize) -> usize {
        self.payload_slot(obj, index).read()
    }

    pub unsafe fn set_payload(&self, obj: usize, index: usize, value: usize) {
        self.payload_slot(obj, index).write(value);
    }
}

impl ObjectModel for SampleObjectModel {
    unsafe fn object_size(&self, addr: usize) -> usize {
        self.header(addr) >> SIZE_SHIFT
    }

    unsafe fn visit_references(&self, obj: usize, visitor: &mut dyn PointerVisitor) {
        let shape = self.shape(obj);

        let wide = self.wide_base(obj) as *mut Ref;
        for i in 0..shape.wide_refs {
            visitor.visit(Slot::Wide(wide.add(i)));
        }

        let narrow = self.narrow_base(obj) as *mut NarrowRef;
        for i in 0..shape.narrow_refs {
            visitor.visit(Slot::Narrow(narrow.add(i), self.codec));
        }
    }

    unsafe fn metadata_slot(&self, obj: usize) -> Option<Slot> {
        if self.header(obj) & HAS_METADATA == 0 {
            return None;
        }

        Some(Slot::Wide((obj + BYTES_PER_WORD) as *mut Ref))
    }

    unsafe fn fill_with_dead(&self, addr: usize, words: usize) {
        debug_assert!(words > 0);
        (addr as *mut usize).write(FILLER | (words << SIZE_SHIFT));
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpaceKind {
    Old,
    Perm,
}

/// Anonymous memory carved into region-aligned spaces, back to back.
pub struct SampleHeap {
    _memory: Box<VirtualMemory>,
    covered: MemoryRegion,
    spaces: Vec<SpaceConfig>,
}

impl SampleHeap {
    /// One space per `(name, kind, regions)` entry, at the region size of `args`.
    pub fn new(args: &CompactArguments, layout: &[(&'static str, SpaceKind, usize)]) -> Result<Self, CollectorError> {
        let region_bytes = (1usize << args.log2_region_words) * BYTES_PER_WORD;
        let regions: usize = layout.iter().map(|&(_, _, regions)| regions).sum();
        let bytes = regions.checked_mul(region_bytes).ok_or_else(|| {
            CollectorError::InvalidConfiguration(format!("{} regions overflow the address space", regions))
        })?;

        let memory = VirtualMemory::allocate_aligned(bytes, region_bytes, "sample heap")
            .ok_or_else(|| CollectorError::reservation("sample heap", bytes))?;
        let covered = MemoryRegion::new(memory.start(), bytes);

        let mut bottom = covered.start();
        let spaces = layout
            .iter()
            .map(|&(name, kind, regions)| {
                let end = bottom + regions * region_bytes;
                let config = match kind {
                    SpaceKind::Old => SpaceConfig::old(name, bottom, end),
                    SpaceKind::Perm => SpaceConfig::perm(name, bottom, end),
                };
                bottom = end;
                config
            })
            .collect();

        Ok(Self {
            _memory: memory,
            covered,
            spaces,
        })
    }

    pub fn covered(&self) -> MemoryRegion {
        self.covered
    }

    pub fn space_configs(&self) -> Vec<SpaceConfig> {
        self.spaces.clone()
    }

    pub fn model(&self) -> SampleObjectModel {
        SampleObjectModel::new(self.covered)
    }

    /// A collector over this heap. The heap must outlive it.
    pub fn collector(&self, args: CompactArguments) -> Result<CollectorContext<SampleObjectModel>, CollectorError> {
        CollectorContext::new(args, self.covered, self.space_configs(), self.model())
    }
}

/// Bump-allocates a zeroed object of `shape` in `space_id`, or returns `None` if the space
/// is full.
pub fn allocate(ctx: &mut CollectorContext<SampleObjectModel>, space_id: usize, shape: ObjectShape) -> Option<usize> {
    let top = ctx.top(space_id);
    let new_top = top.checked_add(shape.size_in_words() * BYTES_PER_WORD)?;
    if new_top > ctx.spaces()[space_id].end() {
        return None;
    }

    unsafe {
        ctx.model().initialize(top, shape);
    }
    ctx.set_top(space_id, new_top);
    Some(top)
}

/// Host roots held in two plain vectors.
#[derive(Default, Debug)]
pub struct SampleRoots {
    pub strong: Vec<Ref>,
    pub weak: Vec<Ref>,
}

impl SampleRoots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_strong(&mut self, addr: usize) {
        self.strong.push(Ref::encode(addr));
    }

    pub fn push_weak(&mut self, addr: usize) {
        self.weak.push(Ref::encode(addr));
    }
}

impl RootSet for SampleRoots {
    fn roots_do(&mut self, visitor: &mut dyn PointerVisitor) {
        for root in self.strong.iter_mut() {
            visitor.visit(Slot::Wide(root));
        }
    }

    fn weak_roots_do(&mut self, visitor: &mut dyn PointerVisitor) {
        for root in self.weak.iter_mut() {
            visitor.visit(Slot::Wide(root));
        }
    }
}
