//! Interceptor pipeline.
//!
//! A call is executed by a linear chain of stages. Each stage receives the
//! request, a handle to the rest of the chain and an [`EventSink`] for the
//! four-event contract:
//!
//! - `Fetch(source)` whenever a source is consulted;
//! - zero or more `Response`s;
//! - then exactly one terminal event, `Failure` or `Completed`.
//!
//! Every downstream stage runs as its own task on the chain's dispatcher and
//! reports back over a channel, so a stage can run branches concurrently and
//! reorder their events before forwarding them.

mod cache;
mod fetcher;
mod parse;
mod server;

pub use cache::CacheInterceptor;
pub use fetcher::{
    fetcher_for, CacheAndNetworkFetcher, CacheFirstFetcher, CacheOnlyFetcher, NetworkFirstFetcher,
    NetworkOnlyFetcher,
};
pub use parse::{ParseInterceptor, ResponseEnvelope};
pub use server::{serialize_request, ServerInterceptor};

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use strata_core::{
    CacheHeaders, FetchSource, GraphQlError, OperationDescriptor, RecordSet, StrataError,
};
use strata_storage::CacheRead;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

#[derive(Debug, Clone)]
pub struct InterceptorRequest {
    /// Unique per execution; also tags this request's optimistic patch.
    pub unique_id: Uuid,
    pub operation: Arc<dyn OperationDescriptor>,
    pub cache_headers: CacheHeaders,
    pub request_headers: BTreeMap<String, String>,
    pub fetch_from_cache: bool,
    pub optimistic_updates: Option<Value>,
    pub send_query_document: bool,
}

impl InterceptorRequest {
    pub fn new(operation: Arc<dyn OperationDescriptor>) -> Self {
        Self {
            unique_id: Uuid::now_v7(),
            operation,
            cache_headers: CacheHeaders::none(),
            request_headers: BTreeMap::new(),
            fetch_from_cache: false,
            optimistic_updates: None,
            send_query_document: true,
        }
    }

    /// Copy of this request aimed at the cache or the network.
    pub fn with_fetch_from_cache(&self, fetch_from_cache: bool) -> Self {
        Self {
            fetch_from_cache,
            ..self.clone()
        }
    }
}

/// Raw transport payload, before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct InterceptorResponse {
    pub source: Option<FetchSource>,
    pub raw: Option<RawResponse>,
    pub data: Option<Value>,
    pub errors: Vec<GraphQlError>,
    pub extensions: Map<String, Value>,
    /// Normalized records of a parsed network response.
    pub records: Option<RecordSet>,
    pub dependent_keys: HashSet<String>,
}

impl InterceptorResponse {
    pub fn from_cache(read: CacheRead) -> Self {
        Self {
            source: Some(FetchSource::Cache),
            data: Some(read.data),
            dependent_keys: read.dependent_keys,
            ..Default::default()
        }
    }

    pub fn from_network(body: Vec<u8>) -> Self {
        Self {
            source: Some(FetchSource::Network),
            raw: Some(RawResponse { body }),
            ..Default::default()
        }
    }

    pub fn fetch_source(&self) -> FetchSource {
        self.source.unwrap_or(FetchSource::Network)
    }
}

#[derive(Debug, Clone)]
pub enum InterceptorEvent {
    Fetch(FetchSource),
    Response(Box<InterceptorResponse>),
    Failure(StrataError),
    Completed,
}

impl InterceptorEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InterceptorEvent::Failure(_) | InterceptorEvent::Completed)
    }
}

// ============================================================================
// EVENT CHANNEL
// ============================================================================

/// Sending half of a stage's events. Drops everything after the first
/// terminal event.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<InterceptorEvent>,
    terminated: Arc<AtomicBool>,
}

/// Receiving half of a stage's events.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<InterceptorEvent>,
}

impl EventSink {
    pub fn channel() -> (EventSink, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventSink {
                tx,
                terminated: Arc::new(AtomicBool::new(false)),
            },
            EventStream { rx },
        )
    }

    fn send(&self, event: InterceptorEvent) {
        if event.is_terminal() {
            if self.terminated.swap(true, Ordering::SeqCst) {
                tracing::trace!(?event, "dropping second terminal event");
                return;
            }
        } else if self.terminated.load(Ordering::SeqCst) {
            tracing::trace!(?event, "dropping event after terminal event");
            return;
        }
        // A closed receiver means the call is gone.
        let _ = self.tx.send(event);
    }

    pub fn on_fetch(&self, source: FetchSource) {
        self.send(InterceptorEvent::Fetch(source));
    }

    pub fn on_response(&self, response: InterceptorResponse) {
        self.send(InterceptorEvent::Response(Box::new(response)));
    }

    pub fn on_failure(&self, error: StrataError) {
        self.send(InterceptorEvent::Failure(error));
    }

    pub fn on_completed(&self) {
        self.send(InterceptorEvent::Completed);
    }

    /// Forward an event received from a downstream stage.
    pub fn forward(&self, event: InterceptorEvent) {
        self.send(event);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl EventStream {
    /// Next event, or `None` once the producing stage is gone.
    pub async fn next(&mut self) -> Option<InterceptorEvent> {
        self.rx.recv().await
    }
}

// ============================================================================
// INTERCEPTOR & CHAIN
// ============================================================================

#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, request: InterceptorRequest, chain: InterceptorChain, sink: EventSink);

    /// Release resources. Called exactly once per call.
    fn dispose(&self) {}
}

/// The remainder of a call's pipeline, from `index` on.
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    index: usize,
    dispatcher: Handle,
    cancel: CancellationToken,
    disposed: Arc<AtomicBool>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl InterceptorChain {
    pub fn new(
        interceptors: Vec<Arc<dyn Interceptor>>,
        dispatcher: Handle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            interceptors: interceptors.into(),
            index: 0,
            dispatcher,
            cancel,
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn dispatcher(&self) -> &Handle {
        &self.dispatcher
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run the rest of the chain and return its events.
    pub fn proceed(&self, request: InterceptorRequest) -> EventStream {
        let (sink, stream) = EventSink::channel();
        self.proceed_into(request, sink);
        stream
    }

    /// Run the rest of the chain, reporting straight into `sink`.
    ///
    /// The stage is dropped mid-flight if the call is canceled; its sink goes
    /// with it and no further events are delivered.
    pub fn proceed_into(&self, request: InterceptorRequest, sink: EventSink) {
        let Some(interceptor) = self.interceptors.get(self.index).cloned() else {
            sink.on_failure(StrataError::illegal_state(
                "interceptor chain exhausted without a terminal stage",
            ));
            return;
        };
        let next = InterceptorChain {
            index: self.index + 1,
            ..self.clone()
        };
        let cancel = self.cancel.clone();
        self.dispatcher.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = interceptor.intercept(request, next, sink) => {}
            }
        });
    }

    /// Dispose every interceptor. Only the first call has any effect.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for interceptor in self.interceptors.iter() {
            interceptor.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_sink_enforces_single_terminal_event() {
        let (sink, mut stream) = EventSink::channel();
        sink.on_fetch(FetchSource::Cache);
        sink.on_completed();
        sink.on_failure(StrataError::illegal_state("late"));
        sink.on_response(InterceptorResponse::default());
        drop(sink);

        assert!(matches!(stream.next().await, Some(InterceptorEvent::Fetch(FetchSource::Cache))));
        assert!(matches!(stream.next().await, Some(InterceptorEvent::Completed)));
        assert!(stream.next().await.is_none());
    }

    struct Terminal;

    #[async_trait]
    impl Interceptor for Terminal {
        async fn intercept(&self, _request: InterceptorRequest, _chain: InterceptorChain, sink: EventSink) {
            sink.on_response(InterceptorResponse::from_network(b"{}".to_vec()));
            sink.on_completed();
        }
    }

    #[derive(Default)]
    struct Disposals(AtomicUsize);

    #[async_trait]
    impl Interceptor for Disposals {
        async fn intercept(&self, request: InterceptorRequest, chain: InterceptorChain, sink: EventSink) {
            chain.proceed_into(request, sink);
        }

        fn dispose(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request() -> InterceptorRequest {
        #[derive(Debug)]
        struct Empty;
        impl OperationDescriptor for Empty {
            fn name(&self) -> &str {
                "Empty"
            }
            fn kind(&self) -> strata_core::OperationKind {
                strata_core::OperationKind::Query
            }
            fn document(&self) -> &str {
                "query Empty { __typename }"
            }
            fn variables(&self) -> strata_core::Variables {
                strata_core::Variables::new()
            }
            fn selections(&self) -> &[strata_core::ResponseField] {
                &[]
            }
        }
        InterceptorRequest::new(Arc::new(Empty))
    }

    #[tokio::test]
    async fn test_chain_runs_stages_in_order_and_disposes_once() {
        let counter = Arc::new(Disposals::default());
        let stages: Vec<Arc<dyn Interceptor>> = vec![counter.clone(), Arc::new(Terminal)];
        let chain = InterceptorChain::new(
            stages,
            Handle::current(),
            CancellationToken::new(),
        );
        let mut stream = chain.proceed(request());
        assert!(matches!(stream.next().await, Some(InterceptorEvent::Response(_))));
        assert!(matches!(stream.next().await, Some(InterceptorEvent::Completed)));

        chain.dispose();
        chain.dispose();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_chain_fails() {
        let chain = InterceptorChain::new(vec![], Handle::current(), CancellationToken::new());
        let mut stream = chain.proceed(request());
        assert!(matches!(stream.next().await, Some(InterceptorEvent::Failure(_))));
    }
}
