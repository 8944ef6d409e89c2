use super::refs::{PointerVisitor, Slot};

/// Object layout queries supplied by the embedding runtime.
///
/// All answers must be derivable from the object's own words: by the time an object is
/// scanned during compaction, any metadata it refers to may already have moved.
pub trait ObjectModel: Send + Sync {
    /// Size in words of the object starting at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be the start of a well-formed object.
    unsafe fn object_size(&self, addr: usize) -> usize;

    /// Reports every interior reference slot of the object at `obj`, excluding the
    /// metadata slot.
    ///
    /// # Safety
    ///
    /// `obj` must be the start of a well-formed object.
    unsafe fn visit_references(&self, obj: usize, visitor: &mut dyn PointerVisitor);

    /// The object's type/metadata reference, if it has one.
    ///
    /// # Safety
    ///
    /// `obj` must be the start of a well-formed object.
    unsafe fn metadata_slot(&self, obj: usize) -> Option<Slot> {
        let _ = obj;
        None
    }

    /// Overwrites `[addr, addr + words)` with one or more dead objects so the heap stays
    /// parsable.
    ///
    /// # Safety
    ///
    /// The range must be dead, writable memory inside the heap.
    unsafe fn fill_with_dead(&self, addr: usize, words: usize);

    /// Smallest object the model can represent, which bounds the smallest fillable gap.
    fn min_object_words(&self) -> usize {
        1
    }
}

/// Host roots.
pub trait RootSet {
    fn roots_do(&mut self, visitor: &mut dyn PointerVisitor);

    fn weak_roots_do(&mut self, visitor: &mut dyn PointerVisitor) {
        let _ = visitor;
    }
}
