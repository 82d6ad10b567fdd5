//! Subscriptions.
//!
//! A subscription is a long-lived stream of payloads for one operation.
//! Payloads do not run through the interceptor pipeline; each one is parsed
//! here and, depending on the [`SubscriptionFetchPolicy`], written to the
//! store and published so watchers of the same records re-deliver.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use strata_core::{
    CacheHeaders, FetchSource, Operation, OperationDescriptor, Response, StrataError, StrataResult,
    SubscriptionFetchPolicy,
};
use strata_storage::StoreExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::call::CallState;
use crate::client::ClientCore;
use crate::interceptor::{serialize_request, InterceptorRequest, ResponseEnvelope};
use crate::transport::{TransportError, TransportRequest};

/// Raw payloads of one subscription, in arrival order.
pub type PayloadStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Opens a subscription. The returned stream ends when the server closes it.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    async fn subscribe(&self, request: TransportRequest) -> Result<PayloadStream, TransportError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent<D> {
    /// The transport accepted the subscription.
    Connected,
    Response(Response<D>),
    Failure(StrataError),
    Completed,
}

/// Events of one executed subscription.
#[derive(Debug)]
pub struct SubscriptionStream<D> {
    rx: mpsc::UnboundedReceiver<SubscriptionEvent<D>>,
}

impl<D> SubscriptionStream<D> {
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent<D>> {
        self.rx.recv().await
    }

    /// Next response or failure, skipping the connect notification.
    pub async fn next_response(&mut self) -> Option<StrataResult<Response<D>>> {
        loop {
            match self.next_event().await? {
                SubscriptionEvent::Response(response) => return Some(Ok(response)),
                SubscriptionEvent::Failure(error) => return Some(Err(error)),
                SubscriptionEvent::Completed => return None,
                SubscriptionEvent::Connected => {}
            }
        }
    }

    pub async fn collect_events(mut self) -> Vec<SubscriptionEvent<D>> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }
}

#[derive(Debug, Clone)]
struct SubscriptionOptions {
    policy: SubscriptionFetchPolicy,
    cache_headers: CacheHeaders,
    request_headers: BTreeMap<String, String>,
    send_query_document: bool,
}

pub struct SubscriptionCall<O: Operation> {
    core: Arc<ClientCore>,
    operation: Arc<O>,
    options: SubscriptionOptions,
    state: Arc<Mutex<CallState>>,
    cancel: CancellationToken,
}

impl<O: Operation> fmt::Debug for SubscriptionCall<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionCall")
            .field("operation", &self.operation.name())
            .field("policy", &self.options.policy)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<O: Operation> SubscriptionCall<O> {
    pub(crate) fn new(core: Arc<ClientCore>, operation: Arc<O>) -> Self {
        let options = SubscriptionOptions {
            policy: SubscriptionFetchPolicy::default(),
            cache_headers: core.config.default_cache_headers.clone(),
            request_headers: BTreeMap::new(),
            send_query_document: core.config.send_query_document,
        };
        Self::with_options(core, operation, options)
    }

    fn with_options(core: Arc<ClientCore>, operation: Arc<O>, options: SubscriptionOptions) -> Self {
        Self {
            core,
            operation,
            options,
            state: Arc::new(Mutex::new(CallState::Idle)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cache_policy(mut self, policy: SubscriptionFetchPolicy) -> Self {
        self.options.policy = policy;
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

    pub fn policy(&self) -> SubscriptionFetchPolicy {
        self.options.policy
    }

    pub fn state(&self) -> CallState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == CallState::Canceled
    }

    /// Open the subscription. Fails without a subscription transport, or if
    /// already executed or canceled.
    pub fn execute(&self) -> StrataResult<SubscriptionStream<O::Data>> {
        let transport = self.core.subscription_transport.clone().ok_or_else(|| {
            StrataError::illegal_state("no subscription transport configured")
        })?;
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .activate(self.operation.name())?;
        self.core.tracker.register_call();

        let descriptor: Arc<dyn OperationDescriptor> = self.operation.clone();
        let mut request = InterceptorRequest::new(descriptor);
        request.request_headers = self.options.request_headers.clone();
        request.send_query_document = self.options.send_query_document;

        let (tx, rx) = mpsc::unbounded_channel();
        let span = tracing::info_span!(
            "strata.subscription",
            operation = %self.operation.name(),
            request_id = %request.unique_id,
            policy = %self.options.policy,
        );
        let driver = Driver {
            core: self.core.clone(),
            operation: self.operation.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            tx,
        };
        self.core
            .dispatcher
            .spawn(driver.run(transport, request).instrument(span));
        Ok(SubscriptionStream { rx })
    }

    /// Stop delivery and close the transport stream. Idempotent.
    pub fn cancel(&self) {
        let was_active = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        if was_active == Some(true) {
            tracing::debug!(operation = self.operation.name(), "canceling subscription");
            self.cancel.cancel();
        }
    }

    /// A fresh, unexecuted subscription with the same operation and options.
    pub fn clone_call(&self) -> Self {
        Self::with_options(self.core.clone(), self.operation.clone(), self.options.clone())
    }
}

// ============================================================================
// DRIVER
// ============================================================================

struct Driver<O: Operation> {
    core: Arc<ClientCore>,
    operation: Arc<O>,
    options: SubscriptionOptions,
    state: Arc<Mutex<CallState>>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<SubscriptionEvent<O::Data>>,
}

impl<O: Operation> Driver<O> {
    async fn run(self, transport: Arc<dyn SubscriptionTransport>, request: InterceptorRequest) {
        // Dropping `deliver` on cancel also drops the payload stream.
        let terminal = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            terminal = self.deliver(transport.as_ref(), &request) => Some(terminal),
        };

        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .terminate();
        if let Some(event) = terminal {
            self.emit(event);
        }
        self.core.tracker.unregister_call();
    }

    async fn deliver(
        &self,
        transport: &dyn SubscriptionTransport,
        request: &InterceptorRequest,
    ) -> SubscriptionEvent<O::Data> {
        if self.options.policy.reads_from_store() {
            match self
                .core
                .store
                .read_operation(self.operation.as_ref(), &self.options.cache_headers)
                .await
            {
                Ok(cached) => self.emit(SubscriptionEvent::Response(cached)),
                Err(error) => tracing::debug!(error = %error, "no cached value for subscription"),
            }
        }

        let body = match serialize_request(request) {
            Ok(body) => body,
            Err(error) => return SubscriptionEvent::Failure(error),
        };
        let transport_request = TransportRequest {
            operation_name: self.operation.name().to_string(),
            body,
            headers: request.request_headers.clone(),
        };
        let mut payloads = match transport.subscribe(transport_request).await {
            Ok(payloads) => payloads,
            Err(error) => {
                tracing::debug!(error = %error, "subscription transport refused");
                return SubscriptionEvent::Failure(error.into());
            }
        };
        self.emit(SubscriptionEvent::Connected);

        while let Some(payload) = payloads.next().await {
            let bytes = match payload {
                Ok(bytes) => bytes,
                Err(error) => {
                    tracing::debug!(error = %error, "subscription stream failed");
                    return SubscriptionEvent::Failure(error.into());
                }
            };
            match self.handle_payload(&bytes).await {
                Ok(response) => self.emit(SubscriptionEvent::Response(response)),
                Err(error) => return SubscriptionEvent::Failure(error),
            }
        }
        SubscriptionEvent::Completed
    }

    /// Decode one payload and, unless the policy says otherwise, write it
    /// through to the store.
    async fn handle_payload(&self, bytes: &[u8]) -> StrataResult<Response<O::Data>> {
        let envelope: ResponseEnvelope = serde_json::from_slice(bytes).map_err(|e| {
            StrataError::parse(format!(
                "failed to parse subscription payload of {}: {e}",
                self.operation.name()
            ))
        })?;
        let errors = envelope.errors.unwrap_or_default();
        let data = envelope
            .data
            .filter(|data| !data.is_null())
            .map(|data| self.operation.parse_data(data))
            .transpose()?;

        let writable = errors.is_empty() || self.options.cache_headers.store_partial_responses();
        let write = data
            .as_ref()
            .filter(|_| self.options.policy.writes_to_store() && writable);
        if let Some(data) = write {
            // A failed write loses the cache update, not the payload.
            let written = self
                .core
                .store
                .write_and_publish(self.operation.as_ref(), data)
                .await;
            if let Err(error) = written {
                tracing::warn!(error = %error, "failed to write subscription payload");
            }
        }

        Ok(Response {
            operation_name: self.operation.name().to_string(),
            data,
            errors,
            dependent_keys: Default::default(),
            source: FetchSource::Network,
            extensions: envelope.extensions.unwrap_or_default(),
        })
    }

    fn emit(&self, event: SubscriptionEvent<O::Data>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.tx.send(event);
    }
}
