//! Record caches.
//!
//! # Layering
//!
//! A store owns one [`OptimisticCache`] wrapping a base [`NormalizedCache`].
//! The base is usually an [`LruNormalizedCache`], optionally placed in front
//! of slower members with a [`ChainedCache`]. Confirmed writes go to the
//! base; speculative writes stay in the optimistic layer until they are
//! rolled back.

pub mod chained;
pub mod memory;
pub mod optimistic;
pub mod traits;

pub use chained::ChainedCache;
pub use memory::{EvictionPolicy, LruNormalizedCache};
pub use optimistic::OptimisticCache;
pub use traits::{remove_cascading, CacheStats, NormalizedCache};
