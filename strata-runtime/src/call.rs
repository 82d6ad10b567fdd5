//! A single execution of an operation.
//!
//! A [`Call`] is configured with builder methods, then executed once. Its
//! events arrive on a [`ResponseStream`]; [`Call::fetch`] drives the stream
//! to the final response. Each call runs its own interceptor chain on the
//! client's dispatcher.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use serde_json::Value;
use strata_core::{
    CacheHeaders, FetchPolicy, FetchSource, Operation, OperationDescriptor, Response, StrataError,
    StrataResult,
};
use strata_storage::to_json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::client::ClientCore;
use crate::interceptor::{InterceptorChain, InterceptorEvent, InterceptorRequest, InterceptorResponse};
use crate::watcher::QueryWatcher;

// ============================================================================
// STATE
// ============================================================================

/// Lifecycle of a call or watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    Active,
    Canceled,
    Terminated,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Active => "active",
            CallState::Canceled => "canceled",
            CallState::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Canceled | CallState::Terminated)
    }

    /// Idle -> Active. Anything else is an error.
    pub(crate) fn activate(&mut self, operation: &str) -> StrataResult<()> {
        match self {
            CallState::Idle => {
                *self = CallState::Active;
                Ok(())
            }
            CallState::Active => Err(StrataError::illegal_state("Already Executed")),
            CallState::Canceled => Err(StrataError::Canceled {
                operation: operation.to_string(),
            }),
            CallState::Terminated => Err(StrataError::illegal_state("Already Terminated")),
        }
    }

    /// Move to Canceled. Returns whether the call was in flight.
    pub(crate) fn cancel(&mut self) -> Option<bool> {
        match self {
            CallState::Idle => {
                *self = CallState::Canceled;
                Some(false)
            }
            CallState::Active => {
                *self = CallState::Canceled;
                Some(true)
            }
            CallState::Canceled | CallState::Terminated => None,
        }
    }

    pub(crate) fn terminate(&mut self) {
        if *self == CallState::Active {
            *self = CallState::Terminated;
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent<D> {
    Fetch(FetchSource),
    Response(Response<D>),
    Failure(StrataError),
    Completed,
}

/// Events of one executed call. Ends after the terminal event, or without
/// one if the call is canceled.
#[derive(Debug)]
pub struct ResponseStream<D> {
    rx: mpsc::UnboundedReceiver<CallEvent<D>>,
}

impl<D> ResponseStream<D> {
    pub async fn next_event(&mut self) -> Option<CallEvent<D>> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<CallEvent<D>> {
        self.rx.try_recv().ok()
    }

    /// Next response or failure, skipping fetch notifications.
    pub async fn next_response(&mut self) -> Option<StrataResult<Response<D>>> {
        loop {
            match self.next_event().await? {
                CallEvent::Response(response) => return Some(Ok(response)),
                CallEvent::Failure(error) => return Some(Err(error)),
                CallEvent::Completed => return None,
                CallEvent::Fetch(_) => {}
            }
        }
    }

    /// Drain every remaining event.
    pub async fn collect_events(mut self) -> Vec<CallEvent<D>> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }
}

// ============================================================================
// CALL
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct CallOptions {
    pub(crate) fetch_policy: FetchPolicy,
    pub(crate) cache_headers: CacheHeaders,
    pub(crate) request_headers: BTreeMap<String, String>,
    pub(crate) optimistic_updates: Option<Value>,
    pub(crate) refetch_queries: Vec<Arc<dyn OperationDescriptor>>,
    pub(crate) refetch_query_names: Vec<String>,
    pub(crate) send_query_document: bool,
}

pub struct Call<O: Operation> {
    core: Arc<ClientCore>,
    operation: Arc<O>,
    options: CallOptions,
    state: Arc<Mutex<CallState>>,
    cancel: CancellationToken,
    chain: Mutex<Option<InterceptorChain>>,
}

impl<O: Operation> fmt::Debug for Call<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("operation", &self.operation.name())
            .field("fetch_policy", &self.options.fetch_policy)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<O: Operation> Call<O> {
    pub(crate) fn with_options(core: Arc<ClientCore>, operation: Arc<O>, options: CallOptions) -> Self {
        Self {
            core,
            operation,
            options,
            state: Arc::new(Mutex::new(CallState::Idle)),
            cancel: CancellationToken::new(),
            chain: Mutex::new(None),
        }
    }

    pub fn fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.options.fetch_policy = policy;
        self
    }

    pub fn cache_headers(mut self, headers: CacheHeaders) -> Self {
        self.options.cache_headers = headers;
        self
    }

    pub fn request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.request_headers.insert(name.into(), value.into());
        self
    }

    /// Data shown through the store while the call is in flight.
    pub fn optimistic_updates(mut self, data: &O::Data) -> StrataResult<Self> {
        self.options.optimistic_updates = Some(to_json(data)?);
        Ok(self)
    }

    /// Queries re-run against the network after this call completes.
    pub fn refetch_queries(mut self, queries: Vec<Arc<dyn OperationDescriptor>>) -> Self {
        self.options.refetch_queries = queries;
        self
    }

    /// Active watchers, by operation name, refetched after this call completes.
    pub fn refetch_query_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.refetch_query_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn send_query_document(mut self, enabled: bool) -> Self {
        self.options.send_query_document = enabled;
        self
    }

    pub fn operation(&self) -> &O {
        &self.operation
    }

    pub fn policy(&self) -> FetchPolicy {
        self.options.fetch_policy
    }

    pub fn state(&self) -> CallState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == CallState::Canceled
    }

    /// Start the call. Fails if it was already executed or canceled.
    pub fn execute(&self) -> StrataResult<ResponseStream<O::Data>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .activate(self.operation.name())?;

        let request = self.build_request();
        let policy = self.options.fetch_policy;
        let chain = InterceptorChain::new(
            self.core.interceptors_for(policy),
            self.core.dispatcher.clone(),
            self.cancel.clone(),
        );
        *self.chain.lock().unwrap_or_else(PoisonError::into_inner) = Some(chain.clone());
        self.core.tracker.register_call();

        let (tx, rx) = mpsc::unbounded_channel();
        let span = tracing::info_span!(
            "strata.call",
            operation = %self.operation.name(),
            request_id = %request.unique_id,
            policy = %policy,
        );
        let driver = Driver {
            core: self.core.clone(),
            operation: self.operation.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            chain,
            tx,
        };
        self.core.dispatcher.spawn(driver.run(request).instrument(span));
        Ok(ResponseStream { rx })
    }

    /// Execute and wait for the final response.
    ///
    /// For cache-and-network this is the network response.
    pub async fn fetch(&self) -> StrataResult<Response<O::Data>> {
        let mut stream = self.execute()?;
        let mut last = None;
        while let Some(event) = stream.next_event().await {
            match event {
                CallEvent::Response(response) => last = Some(response),
                CallEvent::Failure(error) => return Err(error),
                CallEvent::Completed => {
                    return last
                        .ok_or_else(|| StrataError::illegal_state("call completed without a response"))
                }
                CallEvent::Fetch(_) => {}
            }
        }
        Err(StrataError::Canceled {
            operation: self.operation.name().to_string(),
        })
    }

    /// Cancel the call. Idempotent; no events are delivered afterwards.
    pub fn cancel(&self) {
        let was_active = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        if was_active == Some(true) {
            tracing::debug!(operation = self.operation.name(), "canceling call");
            self.cancel.cancel();
            if let Some(chain) = self.chain.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                chain.dispose();
            }
        }
    }

    /// A fresh, unexecuted call with the same operation and options.
    pub fn clone_call(&self) -> Self {
        Self::with_options(self.core.clone(), self.operation.clone(), self.options.clone())
    }

    /// Turn this call into a watcher that re-delivers whenever the records
    /// it read change.
    pub fn watcher(self) -> QueryWatcher<O> {
        QueryWatcher::new(self.core, self.operation, self.options)
    }

    fn build_request(&self) -> InterceptorRequest {
        let descriptor: Arc<dyn OperationDescriptor> = self.operation.clone();
        let mut request = InterceptorRequest::new(descriptor);
        request.cache_headers = self.options.cache_headers.clone();
        request.request_headers = self.options.request_headers.clone();
        request.optimistic_updates = self.options.optimistic_updates.clone();
        request.send_query_document = self.options.send_query_document;
        request
    }
}

// ============================================================================
// DRIVER
// ============================================================================

struct Driver<O: Operation> {
    core: Arc<ClientCore>,
    operation: Arc<O>,
    options: CallOptions,
    state: Arc<Mutex<CallState>>,
    cancel: CancellationToken,
    chain: InterceptorChain,
    tx: mpsc::UnboundedSender<CallEvent<O::Data>>,
}

impl<O: Operation> Driver<O> {
    async fn run(self, request: InterceptorRequest) {
        let mut events = self.chain.proceed(request);
        let mut terminal = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                event = events.next() => event,
            };
            let Some(event) = event else {
                if !self.cancel.is_cancelled() {
                    terminal = Some(CallEvent::Failure(StrataError::illegal_state(
                        "interceptor chain ended without a terminal event",
                    )));
                }
                break;
            };
            match event {
                InterceptorEvent::Fetch(source) => self.emit(CallEvent::Fetch(source)),
                InterceptorEvent::Response(response) => match self.convert(*response) {
                    Ok(response) => self.emit(CallEvent::Response(response)),
                    Err(error) => {
                        terminal = Some(CallEvent::Failure(error));
                        break;
                    }
                },
                InterceptorEvent::Failure(error) => {
                    tracing::debug!(error = %error, "call failed");
                    terminal = Some(CallEvent::Failure(error));
                    break;
                }
                InterceptorEvent::Completed => {
                    terminal = Some(CallEvent::Completed);
                    break;
                }
            }
        }

        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .terminate();
        if matches!(terminal, Some(CallEvent::Completed)) {
            self.start_refetches();
        }
        self.chain.dispose();
        if let Some(event) = terminal {
            self.emit(event);
        }
        // After the terminal event, so an idle callback never runs ahead of it.
        self.core.tracker.unregister_call();
    }

    fn emit(&self, event: CallEvent<O::Data>) {
        if self.cancel.is_cancelled() {
            return;
        }
        // The receiver may have been dropped; the call still runs to the end.
        let _ = self.tx.send(event);
    }

    fn convert(&self, response: InterceptorResponse) -> StrataResult<Response<O::Data>> {
        let source = response.fetch_source();
        let data = response
            .data
            .map(|data| self.operation.parse_data(data))
            .transpose()?;
        Ok(Response {
            operation_name: self.operation.name().to_string(),
            data,
            errors: response.errors,
            dependent_keys: response.dependent_keys,
            source,
            extensions: response.extensions,
        })
    }

    fn start_refetches(&self) {
        for name in &self.options.refetch_query_names {
            for watcher in self.core.tracker.watchers_named(name) {
                if let Err(error) = watcher.refetch() {
                    tracing::debug!(watcher = %name, error = %error, "failed to refetch watcher");
                }
            }
        }

        if self.options.refetch_queries.is_empty() {
            return;
        }
        let queries = self.options.refetch_queries.clone();
        let core = self.core.clone();
        core.tracker.register_call();
        self.core.dispatcher.spawn(async move {
            let runs = queries
                .iter()
                .map(|query| core.run_detached(query.clone(), FetchPolicy::NetworkOnly));
            for (query, result) in queries.iter().zip(join_all(runs).await) {
                if let Err(error) = result {
                    tracing::warn!(query = query.name(), error = %error, "refetch query failed");
                }
            }
            core.tracker.unregister_call();
        });
    }
}
