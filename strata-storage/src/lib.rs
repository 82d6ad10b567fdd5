//! STRATA Storage - Record Caches and Store Facade
//!
//! Pluggable record caches, the optimistic layer, the reader that rebuilds
//! responses from records, and the transactional [`Store`] the runtime
//! talks to.

pub mod cache;
pub mod reader;
pub mod store;

pub use cache::{
    CacheStats, ChainedCache, EvictionPolicy, LruNormalizedCache, NormalizedCache,
    OptimisticCache,
};
pub use reader::{CacheRead, CacheReader};
pub use store::{
    keys_intersect, to_json, NoOpStore, NormalizedStore, RecordChangeSubscriber, Store, StoreExt,
    SubscriberRegistry, SubscriptionId,
};
