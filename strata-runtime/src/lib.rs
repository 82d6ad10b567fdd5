//! STRATA Runtime - Calls, Fetch Policies and Watchers
//!
//! Executes operations through an interceptor pipeline that combines the
//! normalized store from `strata-storage` with a pluggable network
//! transport:
//!
//! ```text
//! application interceptors -> fetch policy -> cache -> parse -> server -> transport
//! ```
//!
//! Calls report through a four-event contract (fetch, response, failure,
//! completed). Watchers re-deliver when records they depend on change.
//! Subscriptions stream payloads from a separate transport and write them
//! through to the store.

pub mod call;
pub mod client;
pub mod interceptor;
pub mod subscription;
pub mod telemetry;
pub mod tracker;
pub mod transport;
pub mod watcher;

pub use call::{Call, CallEvent, CallState, ResponseStream};
pub use client::{StrataClient, StrataClientBuilder};
pub use interceptor::{
    EventSink, EventStream, Interceptor, InterceptorChain, InterceptorEvent, InterceptorRequest,
    InterceptorResponse,
};
pub use subscription::{
    PayloadStream, SubscriptionCall, SubscriptionEvent, SubscriptionStream, SubscriptionTransport,
};
pub use telemetry::{init_tracing, TelemetryConfig};
pub use tracker::{CallTracker, Refetchable};
pub use transport::{NetworkTransport, TransportError, TransportRequest};
pub use watcher::{QueryWatcher, WatchStream};

// Re-export the crates callers need to define operations and caches.
pub use strata_core;
pub use strata_storage;
