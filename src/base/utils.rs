pub const fn round_up(x: isize, n: isize) -> isize {
    round_down(x + n - 1, n)
}

pub const fn round_down(x: isize, n: isize) -> isize {
    x & -n
}

/// Number of whole words between `left` and `right` (`left >= right`).
#[inline(always)]
pub fn pointer_delta(left: usize, right: usize) -> usize {
    debug_assert!(left >= right, "pointer_delta: 0x{:x} < 0x{:x}", left, right);
    (left - right) >> super::constants::LOG_BYTES_PER_WORD
}

/// determine log_2 of given value
pub const fn log2(val: usize) -> usize {
    (usize::BITS - 1 - val.leading_zeros()) as usize
}
