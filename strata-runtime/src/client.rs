//! Client facade and builder.

use std::fmt;
use std::sync::Arc;

use strata_core::{
    CacheKeyBuilder, CacheKeyResolver, ConfigError, DefaultCacheKeyBuilder, FetchPolicy,
    NoKeyResolver, Operation, OperationDescriptor, StrataConfig, StrataError, StrataResult,
};
use strata_storage::{
    EvictionPolicy, LruNormalizedCache, NoOpStore, NormalizedCache, NormalizedStore, Store,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::call::{Call, CallOptions};
use crate::interceptor::{
    fetcher_for, CacheInterceptor, Interceptor, InterceptorChain, InterceptorEvent,
    InterceptorRequest, ParseInterceptor, ServerInterceptor,
};
use crate::subscription::{SubscriptionCall, SubscriptionTransport};
use crate::telemetry::TelemetryConfig;
use crate::tracker::CallTracker;
use crate::transport::NetworkTransport;

/// State shared by a client and every call it creates.
pub(crate) struct ClientCore {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) transport: Arc<dyn NetworkTransport>,
    pub(crate) subscription_transport: Option<Arc<dyn SubscriptionTransport>>,
    pub(crate) dispatcher: Handle,
    pub(crate) config: StrataConfig,
    pub(crate) interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) tracker: CallTracker,
}

impl ClientCore {
    /// Pipeline for one call: application stages, then the fetch policy,
    /// the store, the parser and finally the transport.
    pub(crate) fn interceptors_for(&self, policy: FetchPolicy) -> Vec<Arc<dyn Interceptor>> {
        let mut chain = self.interceptors.clone();
        chain.push(fetcher_for(policy));
        chain.push(Arc::new(
            CacheInterceptor::new(self.store.clone(), self.dispatcher.clone())
                .write_asynchronously(self.config.write_to_cache_asynchronously),
        ));
        chain.push(Arc::new(ParseInterceptor::new(self.store.clone())));
        chain.push(Arc::new(ServerInterceptor::new(self.transport.clone())));
        chain
    }

    pub(crate) fn default_options(&self, fetch_policy: FetchPolicy) -> CallOptions {
        CallOptions {
            fetch_policy,
            cache_headers: self.config.default_cache_headers.clone(),
            request_headers: Default::default(),
            optimistic_updates: None,
            refetch_queries: Vec::new(),
            refetch_query_names: Vec::new(),
            send_query_document: self.config.send_query_document,
        }
    }

    /// Run an untyped operation to completion, discarding its data.
    pub(crate) async fn run_detached(
        &self,
        operation: Arc<dyn OperationDescriptor>,
        policy: FetchPolicy,
    ) -> StrataResult<()> {
        let mut request = InterceptorRequest::new(operation);
        request.cache_headers = self.config.default_cache_headers.clone();
        request.send_query_document = self.config.send_query_document;

        let chain = InterceptorChain::new(
            self.interceptors_for(policy),
            self.dispatcher.clone(),
            CancellationToken::new(),
        );
        let mut events = chain.proceed(request);
        let mut outcome = Err(StrataError::illegal_state(
            "interceptor chain ended without a terminal event",
        ));
        while let Some(event) = events.next().await {
            match event {
                InterceptorEvent::Completed => {
                    outcome = Ok(());
                    break;
                }
                InterceptorEvent::Failure(error) => {
                    outcome = Err(error);
                    break;
                }
                InterceptorEvent::Fetch(_) | InterceptorEvent::Response(_) => {}
            }
        }
        chain.dispose();
        outcome
    }
}

/// Entry point for executing operations.
#[derive(Clone)]
pub struct StrataClient {
    core: Arc<ClientCore>,
}

impl fmt::Debug for StrataClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrataClient")
            .field("store_enabled", &self.core.store.is_enabled())
            .field("tracker", &self.core.tracker)
            .finish_non_exhaustive()
    }
}

impl StrataClient {
    pub fn builder() -> StrataClientBuilder {
        StrataClientBuilder::default()
    }

    /// A call for a query, using the configured default fetch policy.
    pub fn query<O: Operation>(&self, operation: O) -> Call<O> {
        let options = self.core.default_options(self.core.config.default_fetch_policy);
        Call::with_options(self.core.clone(), Arc::new(operation), options)
    }

    /// A call for a mutation. Mutations always go to the network.
    pub fn mutate<O: Operation>(&self, operation: O) -> Call<O> {
        let options = self.core.default_options(FetchPolicy::NetworkOnly);
        Call::with_options(self.core.clone(), Arc::new(operation), options)
    }

    /// A subscription, writing every payload through to the store unless
    /// told otherwise with [`SubscriptionCall::cache_policy`].
    pub fn subscribe<O: Operation>(&self, operation: O) -> SubscriptionCall<O> {
        SubscriptionCall::new(self.core.clone(), Arc::new(operation))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.core.store
    }

    pub fn config(&self) -> &StrataConfig {
        &self.core.config
    }

    /// Install the global tracing subscriber using this client's
    /// `log_filter`. Returns `Ok(false)` if one was already installed.
    pub fn init_tracing(&self) -> StrataResult<bool> {
        crate::telemetry::init_tracing(&TelemetryConfig::from(&self.core.config))
    }

    pub async fn clear_normalized_cache(&self) -> StrataResult<()> {
        self.core.store.clear_all().await
    }

    /// Calls currently in flight, including background refetches.
    pub fn active_call_count(&self) -> usize {
        self.core.tracker.active_call_count()
    }

    pub fn active_watcher_count(&self) -> usize {
        self.core.tracker.active_watcher_count()
    }

    /// Invoked every time the number of active calls drops to zero.
    pub fn set_idle_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.core.tracker.set_idle_callback(Some(Arc::new(callback)));
    }

    pub fn clear_idle_callback(&self) {
        self.core.tracker.set_idle_callback(None);
    }
}

// ============================================================================
// BUILDER
// ============================================================================

#[derive(Default)]
pub struct StrataClientBuilder {
    transport: Option<Arc<dyn NetworkTransport>>,
    subscription_transport: Option<Arc<dyn SubscriptionTransport>>,
    cache: Option<Arc<dyn NormalizedCache>>,
    store: Option<Arc<dyn Store>>,
    resolver: Option<Arc<dyn CacheKeyResolver>>,
    key_builder: Option<Arc<dyn CacheKeyBuilder>>,
    dispatcher: Option<Handle>,
    config: Option<StrataConfig>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl StrataClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn NetworkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn subscription_transport(mut self, transport: Arc<dyn SubscriptionTransport>) -> Self {
        self.subscription_transport = Some(transport);
        self
    }

    /// Record cache behind the store. Defaults to an LRU cache bounded by
    /// the configured eviction settings.
    pub fn normalized_cache(mut self, cache: Arc<dyn NormalizedCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a prebuilt store instead of building one from the cache.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cache_key_resolver(mut self, resolver: Arc<dyn CacheKeyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn cache_key_builder(mut self, key_builder: Arc<dyn CacheKeyBuilder>) -> Self {
        self.key_builder = Some(key_builder);
        self
    }

    /// Runtime the pipeline runs on. Defaults to the current one.
    pub fn dispatcher(mut self, dispatcher: Handle) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn config(mut self, config: StrataConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Application stage, run before the fetch policy. Order is preserved.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> StrataResult<StrataClient> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let transport = self.transport.ok_or_else(|| ConfigError::InvalidValue {
            field: "transport".to_string(),
            value: "none".to_string(),
            reason: "a network transport is required".to_string(),
        })?;

        let dispatcher = match self.dispatcher {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| {
                StrataError::illegal_state(format!("no dispatcher given and no current runtime: {e}"))
            })?,
        };

        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None if !config.store_enabled => Arc::new(NoOpStore),
            None => {
                let cache: Arc<dyn NormalizedCache> = match self.cache {
                    Some(cache) => cache,
                    None => Arc::new(LruNormalizedCache::new(EvictionPolicy::from(&config.eviction))),
                };
                let resolver: Arc<dyn CacheKeyResolver> = match self.resolver {
                    Some(resolver) => resolver,
                    None => Arc::new(NoKeyResolver),
                };
                let key_builder: Arc<dyn CacheKeyBuilder> = match self.key_builder {
                    Some(key_builder) => key_builder,
                    None => Arc::new(DefaultCacheKeyBuilder),
                };
                Arc::new(NormalizedStore::new(cache, resolver).with_key_builder(key_builder))
            }
        };

        tracing::debug!(
            store_enabled = store.is_enabled(),
            default_fetch_policy = %config.default_fetch_policy,
            interceptors = self.interceptors.len(),
            "client built"
        );

        Ok(StrataClient {
            core: Arc::new(ClientCore {
                store,
                transport,
                subscription_transport: self.subscription_transport,
                dispatcher,
                config,
                interceptors: self.interceptors,
                tracker: CallTracker::new(),
            }),
        })
    }
}
