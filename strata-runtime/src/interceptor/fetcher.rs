//! Fetch-policy stages.
//!
//! Each policy is a stage that decides whether the remainder of the chain
//! runs against the cache, the network, or both, and in which order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use strata_core::{FetchPolicy, StrataError};

use super::{EventSink, EventStream, Interceptor, InterceptorChain, InterceptorEvent, InterceptorRequest};

/// Build the stage for a fetch policy.
pub fn fetcher_for(policy: FetchPolicy) -> Arc<dyn Interceptor> {
    match policy {
        FetchPolicy::CacheOnly => Arc::new(CacheOnlyFetcher),
        FetchPolicy::NetworkOnly => Arc::new(NetworkOnlyFetcher),
        FetchPolicy::CacheFirst => Arc::new(CacheFirstFetcher::default()),
        FetchPolicy::NetworkFirst => Arc::new(NetworkFirstFetcher::default()),
        FetchPolicy::CacheAndNetwork => Arc::new(CacheAndNetworkFetcher::default()),
    }
}

fn branch_closed() -> StrataError {
    StrataError::illegal_state("branch ended without a terminal event")
}

/// Forward events until the branch terminates. A failure, or a branch that
/// closes without a terminal event, is handed back to the caller instead of
/// being forwarded.
async fn forward_until_failure(stream: &mut EventStream, sink: &EventSink) -> Option<StrataError> {
    while let Some(event) = stream.next().await {
        match event {
            InterceptorEvent::Failure(error) => return Some(error),
            InterceptorEvent::Completed => {
                sink.on_completed();
                return None;
            }
            other => sink.forward(other),
        }
    }
    Some(branch_closed())
}

// ============================================================================
// SINGLE SOURCE
// ============================================================================

#[derive(Debug, Default)]
pub struct CacheOnlyFetcher;

#[async_trait]
impl Interceptor for CacheOnlyFetcher {
    async fn intercept(&self, request: InterceptorRequest, chain: InterceptorChain, sink: EventSink) {
        chain.proceed_into(request.with_fetch_from_cache(true), sink);
    }
}

#[derive(Debug, Default)]
pub struct NetworkOnlyFetcher;

#[async_trait]
impl Interceptor for NetworkOnlyFetcher {
    async fn intercept(&self, request: InterceptorRequest, chain: InterceptorChain, sink: EventSink) {
        chain.proceed_into(request.with_fetch_from_cache(false), sink);
    }
}

// ============================================================================
// FALLBACK
// ============================================================================

/// Cache, then network if the cache read fails.
#[derive(Debug, Default)]
pub struct CacheFirstFetcher {
    disposed: AtomicBool,
}

#[async_trait]
impl Interceptor for CacheFirstFetcher {
    async fn intercept(&self, request: InterceptorRequest, chain: InterceptorChain, sink: EventSink) {
        let mut cache = chain.proceed(request.with_fetch_from_cache(true));
        let Some(error) = forward_until_failure(&mut cache, &sink).await else {
            return;
        };
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        tracing::debug!(
            operation = request.operation.name(),
            error = %error,
            "cache read failed, falling back to network"
        );
        chain.proceed_into(request.with_fetch_from_cache(false), sink);
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Network, then cache if the network fails. When both fail the network
/// error is reported.
#[derive(Debug, Default)]
pub struct NetworkFirstFetcher {
    disposed: AtomicBool,
}

#[async_trait]
impl Interceptor for NetworkFirstFetcher {
    async fn intercept(&self, request: InterceptorRequest, chain: InterceptorChain, sink: EventSink) {
        let mut network = chain.proceed(request.with_fetch_from_cache(false));
        let Some(network_error) = forward_until_failure(&mut network, &sink).await else {
            return;
        };
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        tracing::debug!(
            operation = request.operation.name(),
            error = %network_error,
            "network failed, falling back to cache"
        );

        let mut cache = chain.proceed(request.with_fetch_from_cache(true));
        if let Some(cache_error) = forward_until_failure(&mut cache, &sink).await {
            tracing::debug!(
                operation = request.operation.name(),
                error = %cache_error,
                "cache fallback failed"
            );
            sink.on_failure(network_error);
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// CACHE AND NETWORK
// ============================================================================

/// Cache and network in parallel.
///
/// Network events are held back until the cache branch has terminated, so
/// everything cache-sourced reaches the caller first. A cache failure is
/// swallowed; the network branch alone decides the terminal event.
#[derive(Debug, Default)]
pub struct CacheAndNetworkFetcher {
    disposed: AtomicBool,
}

#[async_trait]
impl Interceptor for CacheAndNetworkFetcher {
    async fn intercept(&self, request: InterceptorRequest, chain: InterceptorChain, sink: EventSink) {
        let mut cache = chain.proceed(request.with_fetch_from_cache(true));
        let mut network = chain.proceed(request.with_fetch_from_cache(false));
        let mut cache_done = false;
        let mut network_done = false;
        let mut held: Vec<InterceptorEvent> = Vec::new();

        while !(cache_done && network_done) {
            if self.disposed.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                event = cache.next(), if !cache_done => match event {
                    Some(InterceptorEvent::Failure(error)) => {
                        tracing::debug!(
                            operation = request.operation.name(),
                            error = %error,
                            "cache branch failed"
                        );
                        cache_done = true;
                    }
                    Some(InterceptorEvent::Completed) | None => cache_done = true,
                    Some(other) => sink.forward(other),
                },
                event = network.next(), if !network_done => match event {
                    Some(event) => {
                        network_done = event.is_terminal();
                        held.push(event);
                    }
                    None => {
                        network_done = true;
                        held.push(InterceptorEvent::Failure(branch_closed()));
                    }
                },
            }
            if cache_done {
                for event in held.drain(..) {
                    sink.forward(event);
                }
            }
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
