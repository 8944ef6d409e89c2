pub mod adjust;
pub mod arguments;
pub mod collector;
pub mod compact;
pub mod dense_prefix;
pub mod error;
pub mod heap;
pub mod mark;
pub mod mark_bitmap;
pub mod object_model;
pub mod refs;
pub mod region;
pub mod sample;
pub mod space;
pub mod start_array;
pub mod summary;
pub mod taskqueue;

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    align_down(addr.wrapping_add(align).wrapping_sub(1), align)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}
