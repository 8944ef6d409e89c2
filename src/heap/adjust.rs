use super::{
    heap::Heap,
    object_model::{ObjectModel, RootSet},
    refs::{PointerVisitor, Ref, Slot, Traversal},
};

/// Rewrites references to their forwarding addresses.
///
/// Null references and references outside of every space are left alone. Under
/// [`Traversal::Weak`] a reference whose word does not belong to a marked object is
/// cleared instead; interior references into live objects are forwarded.
pub struct AdjustPointer<'a, M: ObjectModel> {
    heap: &'a Heap<M>,
    traversal: Traversal,
    cleared: usize,
}

impl<'a, M: ObjectModel> AdjustPointer<'a, M> {
    pub fn new(heap: &'a Heap<M>, traversal: Traversal) -> Self {
        Self {
            heap,
            traversal,
            cleared: 0,
        }
    }

    /// Weak references cleared so far.
    pub fn cleared(&self) -> usize {
        self.cleared
    }
}

impl<'a, M: ObjectModel> PointerVisitor for AdjustPointer<'a, M> {
    fn visit(&mut self, slot: Slot) {
        unsafe {
            if adjust_pointer(self.heap, slot, self.traversal) == Adjusted::Cleared {
                self.cleared += 1;
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Adjusted {
    Untouched,
    Forwarded,
    Cleared,
}

/// Forwards the reference held in `slot`.
///
/// # Safety
///
/// `slot` must be valid for reads and writes and, unless it is null or outside of the
/// spaces, hold a reference into a live object of the current cycle.
pub unsafe fn adjust_pointer<M: ObjectModel>(heap: &Heap<M>, slot: Slot, traversal: Traversal) -> Adjusted {
    let r = slot.load();
    if r.is_null() {
        return Adjusted::Untouched;
    }

    let addr = r.decode();
    if !heap.is_in_space(addr) {
        return Adjusted::Untouched;
    }

    if traversal == Traversal::Weak && !heap.is_live_word(addr) {
        slot.store(Ref::NULL);
        return Adjusted::Cleared;
    }

    let new_addr = heap.calc_new_pointer(addr);
    if new_addr != addr {
        slot.store(Ref::encode(new_addr));
    }
    Adjusted::Forwarded
}

/// Forwards the host's strong roots, then its weak roots. Returns the number of weak roots
/// that were cleared.
pub fn adjust_roots<M: ObjectModel>(heap: &Heap<M>, roots: &mut dyn RootSet) -> usize {
    roots.roots_do(&mut AdjustPointer::new(heap, Traversal::Root));

    let mut weak = AdjustPointer::new(heap, Traversal::Weak);
    roots.weak_roots_do(&mut weak);
    weak.cleared()
}
