//! Parallel mark-compact collector core.
//!
//! The collector marks live objects into a [`ParMarkBitmap`](heap::mark_bitmap::ParMarkBitmap),
//! summarizes them per region into [`ParallelCompactData`](heap::summary::ParallelCompactData),
//! chooses a dense prefix per space and then slides the remaining live data towards the
//! bottom of each space with a pool of work-stealing workers.
//!
//! The embedding runtime supplies the object layout through [`ObjectModel`](heap::object_model::ObjectModel)
//! and its roots through [`RootSet`](heap::object_model::RootSet). Everything else lives in
//! [`CollectorContext`](heap::collector::CollectorContext).

pub mod base;
pub mod heap;
pub mod utils;

pub use heap::collector::{CollectionSummary, CollectorContext, SpaceSummary};
pub use heap::error::CollectorError;
pub use heap::arguments::{CompactArguments, SpaceConfig};
pub use utils::formatted_size;

#[cfg(test)]
pub mod tests;
