use core::fmt;

use crate::{
    base::constants::{BYTES_PER_WORD, LOG_BYTES_PER_WORD},
    formatted_size,
    heap::{error::CollectorError, region::LOS_MASK},
    utils::{read_bool_from_env, read_float_from_env, read_uint_from_env},
};

/// User-facing collector knobs.
#[derive(Clone, Debug)]
pub struct CompactArguments {
    pub parallel_gc_threads: usize,
    /// log2 of the region size in words.
    pub log2_region_words: usize,
    /// log2 of the block size in words, at most `log2_region_words`.
    pub log2_block_words: usize,
    /// When false every collection is a maximum compaction.
    pub use_dense_prefix: bool,
    /// Mean of the dead wood limiter's normal distribution, in percent.
    pub dead_wood_limiter_mean: usize,
    /// Standard deviation of the dead wood limiter's normal distribution, in percent.
    pub dead_wood_limiter_std_dev: usize,
    /// Collections between forced maximum compactions.
    pub maximum_compaction_interval: usize,
    /// The collection with this number is always a maximum compaction.
    pub first_maximum_compaction_count: usize,
    /// Dense prefix update tasks per worker when the prefix is large enough.
    pub dense_prefix_tasks_per_thread: usize,
    pub verify: bool,
}

impl Default for CompactArguments {
    fn default() -> Self {
        Self {
            parallel_gc_threads: num_cpus::get().max(1),
            log2_region_words: 9,
            log2_block_words: 7,
            use_dense_prefix: true,
            dead_wood_limiter_mean: 50,
            dead_wood_limiter_std_dev: 80,
            maximum_compaction_interval: 20,
            first_maximum_compaction_count: 3,
            dense_prefix_tasks_per_thread: 4,
            verify: cfg!(debug_assertions),
        }
    }
}

impl CompactArguments {
    /// Defaults overlaid with `PC_*` environment variables.
    pub fn from_env() -> Self {
        let mut args = Self::default();

        if let Some(threads) = read_uint_from_env("PC_GC_THREADS") {
            args.parallel_gc_threads = threads;
        }
        if let Some(log2) = read_uint_from_env("PC_LOG2_REGION_WORDS") {
            args.log2_region_words = log2;
        }
        if let Some(log2) = read_uint_from_env("PC_LOG2_BLOCK_WORDS") {
            args.log2_block_words = log2;
        }
        if let Some(flag) = read_bool_from_env("PC_USE_DENSE_PREFIX") {
            args.use_dense_prefix = flag;
        }
        if let Some(mean) = read_float_from_env("PC_DEAD_WOOD_MEAN") {
            args.dead_wood_limiter_mean = mean as usize;
        }
        if let Some(std_dev) = read_float_from_env("PC_DEAD_WOOD_STD_DEV") {
            args.dead_wood_limiter_std_dev = std_dev as usize;
        }
        if let Some(interval) = read_uint_from_env("PC_MAX_COMPACTION_INTERVAL") {
            args.maximum_compaction_interval = interval;
        }
        if let Some(count) = read_uint_from_env("PC_FIRST_MAX_COMPACTION_COUNT") {
            args.first_maximum_compaction_count = count;
        }
        if let Some(flag) = read_bool_from_env("PC_VERIFY") {
            args.verify = flag;
        }

        args
    }
}

/// One compactable space as handed over by the host.
#[derive(Clone, Debug)]
pub struct SpaceConfig {
    pub name: &'static str,
    pub bottom: usize,
    pub end: usize,
    pub top: usize,
    /// Minimum percentage of dead space the dense prefix may leave behind.
    pub dead_ratio: usize,
}

impl SpaceConfig {
    pub fn old(name: &'static str, bottom: usize, end: usize) -> Self {
        Self {
            name,
            bottom,
            end,
            top: bottom,
            dead_ratio: 5,
        }
    }

    pub fn perm(name: &'static str, bottom: usize, end: usize) -> Self {
        Self {
            name,
            bottom,
            end,
            top: bottom,
            dead_ratio: 20,
        }
    }
}

/// Geometry derived from [`CompactArguments`] and the covered range.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct CompactOptions {
    pub log2_region_words: usize,
    pub region_size_words: usize,
    pub region_size_bytes: usize,
    pub log2_region_bytes: usize,
    pub region_words_mask: usize,
    pub log2_block_words: usize,
    pub block_size_words: usize,
    pub block_size_bytes: usize,
    pub log2_block_bytes: usize,
    pub log2_blocks_per_region: usize,
    pub blocks_per_region: usize,
    pub region_count: usize,
    pub block_count: usize,
    pub covered_bytes: usize,
}

/// Regions must hold at least one object start array card.
pub const MIN_LOG2_REGION_WORDS: usize = 6;

impl CompactOptions {
    pub fn new(args: &CompactArguments, covered_bytes: usize) -> Result<Self, CollectorError> {
        let invalid = |msg: String| Err(CollectorError::InvalidConfiguration(msg));

        if args.parallel_gc_threads == 0 {
            return invalid("parallel_gc_threads must be at least 1".to_string());
        }
        if args.log2_region_words < MIN_LOG2_REGION_WORDS {
            return invalid(format!(
                "region size 2^{} words is below the minimum of 2^{}",
                args.log2_region_words, MIN_LOG2_REGION_WORDS
            ));
        }
        // A completely live region must still fit the live size field.
        if (1usize << args.log2_region_words) > LOS_MASK as usize {
            return invalid(format!(
                "region size 2^{} words does not fit the live size field",
                args.log2_region_words
            ));
        }
        if args.log2_block_words > args.log2_region_words {
            return invalid(format!(
                "block size 2^{} words exceeds region size 2^{} words",
                args.log2_block_words, args.log2_region_words
            ));
        }

        let region_size_words = 1 << args.log2_region_words;
        let region_size_bytes = region_size_words * BYTES_PER_WORD;

        if covered_bytes == 0 || covered_bytes % region_size_bytes != 0 {
            return invalid(format!(
                "covered range of {} bytes is not a multiple of the region size ({} bytes)",
                covered_bytes, region_size_bytes
            ));
        }

        let region_count = covered_bytes / region_size_bytes;
        let log2_blocks_per_region = args.log2_region_words - args.log2_block_words;

        Ok(Self {
            log2_region_words: args.log2_region_words,
            region_size_words,
            region_size_bytes,
            log2_region_bytes: args.log2_region_words + LOG_BYTES_PER_WORD,
            region_words_mask: region_size_words - 1,
            log2_block_words: args.log2_block_words,
            block_size_words: 1 << args.log2_block_words,
            block_size_bytes: (1 << args.log2_block_words) * BYTES_PER_WORD,
            log2_block_bytes: args.log2_block_words + LOG_BYTES_PER_WORD,
            log2_blocks_per_region,
            blocks_per_region: 1 << log2_blocks_per_region,
            region_count,
            block_count: region_count << log2_blocks_per_region,
            covered_bytes,
        })
    }

    pub fn log_sizes(&self) {
        log::info!(target: "gc", "- Covered: {}", formatted_size(self.covered_bytes));
        log::info!(
            target: "gc",
            "- Region size: {} ({} words), count: {}",
            formatted_size(self.region_size_bytes),
            self.region_size_words,
            self.region_count
        );
        log::info!(
            target: "gc",
            "- Block size: {} ({} words), {} per region",
            formatted_size(self.block_size_bytes),
            self.block_size_words,
            self.blocks_per_region
        );
    }
}

impl fmt::Display for CompactOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactOptions")
            .field("region_size_bytes", &formatted_size(self.region_size_bytes))
            .field("region_size_words", &self.region_size_words)
            .field("log2_region_words", &self.log2_region_words)
            .field("block_size_words", &self.block_size_words)
            .field("blocks_per_region", &self.blocks_per_region)
            .field("region_count", &self.region_count)
            .field("block_count", &self.block_count)
            .field("covered", &formatted_size(self.covered_bytes))
            .finish()
    }
}
