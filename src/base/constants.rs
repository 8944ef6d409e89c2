use std::mem::size_of;

pub const BYTES_PER_WORD: usize = size_of::<usize>();
pub const BITS_PER_WORD: usize = BYTES_PER_WORD * 8;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        pub const LOG_BYTES_PER_WORD: usize = 3;
        pub const LOG_BITS_PER_WORD: usize = 6;
    } else if #[cfg(target_pointer_width = "32")] {
        pub const LOG_BYTES_PER_WORD: usize = 2;
        pub const LOG_BITS_PER_WORD: usize = 5;
    } else {
        compile_error!("unsupported pointer width");
    }
}

pub const K: usize = 1024;
pub const M: usize = K * K;
