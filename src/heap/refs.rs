//! Reference values and the slots that hold them.
//!
//! Forwarding only ever deals in full-width [`Ref`]s. Narrow (compressed) slots carry
//! their [`CompressedRefs`] codec with them, so loading and storing through a [`Slot`]
//! hides the encoding from everything above this module.

use crate::base::constants::LOG_BYTES_PER_WORD;

/// A full-width heap reference. [`Ref::NULL`] (address zero) is the "no object" value.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Ref(usize);

impl Ref {
    pub const NULL: Ref = Ref(0);

    #[inline(always)]
    pub const fn encode(addr: usize) -> Ref {
        Ref(addr)
    }

    /// Address of the referent, zero for [`Ref::NULL`].
    #[inline(always)]
    pub const fn decode(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A 32-bit compressed reference; zero is null.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct NarrowRef(u32);

impl NarrowRef {
    pub const NULL: NarrowRef = NarrowRef(0);

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// Base-plus-shift codec for [`NarrowRef`].
///
/// `base` must lie below every encodable address so that no live object encodes to zero.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CompressedRefs {
    base: usize,
    shift: u32,
}

impl CompressedRefs {
    pub const fn new(base: usize, shift: u32) -> Self {
        Self { base, shift }
    }

    /// Word-granular codec for a heap starting at `heap_start`.
    pub const fn for_heap(heap_start: usize) -> Self {
        Self {
            base: heap_start - (1 << LOG_BYTES_PER_WORD),
            shift: LOG_BYTES_PER_WORD as u32,
        }
    }

    pub const fn base(&self) -> usize {
        self.base
    }

    pub const fn shift(&self) -> u32 {
        self.shift
    }

    #[inline]
    pub fn encode(&self, r: Ref) -> NarrowRef {
        if r.is_null() {
            return NarrowRef::NULL;
        }

        let addr = r.decode();
        assert!(addr > self.base, "reference 0x{:x} below narrow base 0x{:x}", addr, self.base);
        let offset = (addr - self.base) >> self.shift;
        assert!(
            offset <= u32::MAX as usize && (offset << self.shift) == addr - self.base,
            "reference 0x{:x} is not encodable",
            addr
        );
        NarrowRef(offset as u32)
    }

    #[inline]
    pub fn decode(&self, n: NarrowRef) -> Ref {
        if n.0 == 0 {
            return Ref::NULL;
        }

        Ref::encode(self.base + ((n.0 as usize) << self.shift))
    }
}

/// Location of a reference inside a root or an object.
#[derive(Clone, Copy, Debug)]
pub enum Slot {
    Wide(*mut Ref),
    Narrow(*mut NarrowRef, CompressedRefs),
}

impl Slot {
    /// # Safety
    ///
    /// The slot must point at readable memory holding a reference of its kind.
    #[inline]
    pub unsafe fn load(self) -> Ref {
        match self {
            Slot::Wide(p) => p.read(),
            Slot::Narrow(p, codec) => codec.decode(p.read()),
        }
    }

    /// # Safety
    ///
    /// The slot must point at writable memory holding a reference of its kind.
    #[inline]
    pub unsafe fn store(self, r: Ref) {
        match self {
            Slot::Wide(p) => p.write(r),
            Slot::Narrow(p, codec) => p.write(codec.encode(r)),
        }
    }
}

/// Which traversal a visitor is part of.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Traversal {
    /// Strong roots supplied by the host.
    Root,
    /// Interior references of heap objects.
    Heap,
    /// Weak roots: referents that did not survive marking are cleared.
    Weak,
}

pub trait PointerVisitor {
    fn visit(&mut self, slot: Slot);
}

impl<F: FnMut(Slot)> PointerVisitor for F {
    fn visit(&mut self, slot: Slot) {
        self(slot)
    }
}
