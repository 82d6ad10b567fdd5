//! Query watchers.
//!
//! A watcher executes its query and then stays subscribed to the records the
//! last response was built from. When a publish touches any of them the
//! query is refetched with the watcher's refetch policy and the new response
//! is delivered on the same [`WatchStream`].

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use strata_core::{FetchPolicy, Operation, Response, StrataError, StrataResult};
use strata_storage::{RecordChangeSubscriber, SubscriptionId};
use tokio::sync::mpsc;

use crate::call::{Call, CallEvent, CallOptions, CallState, ResponseStream};
use crate::client::ClientCore;
use crate::tracker::Refetchable;

static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Responses of a watcher, in delivery order. Ends when the watcher is
/// canceled or terminates on a failure.
#[derive(Debug)]
pub struct WatchStream<D> {
    rx: mpsc::UnboundedReceiver<StrataResult<Response<D>>>,
}

impl<D> WatchStream<D> {
    pub async fn next(&mut self) -> Option<StrataResult<Response<D>>> {
        self.rx.recv().await
    }

    /// Next response if one is already queued.
    pub fn try_next(&mut self) -> Option<StrataResult<Response<D>>> {
        self.rx.try_recv().ok()
    }
}

pub struct QueryWatcher<O: Operation> {
    inner: Arc<WatcherInner<O>>,
}

struct WatcherInner<O: Operation> {
    id: u64,
    this: Weak<WatcherInner<O>>,
    core: Arc<ClientCore>,
    operation: Arc<O>,
    options: CallOptions,
    state: Mutex<WatcherState<O>>,
}

struct WatcherState<O: Operation> {
    state: CallState,
    refetch_policy: FetchPolicy,
    /// Bumped per call; events from older calls are dropped.
    generation: u64,
    active_call: Option<Call<O>>,
    subscription: Option<SubscriptionId>,
    sender: Option<mpsc::UnboundedSender<StrataResult<Response<O::Data>>>>,
}

impl<O: Operation> fmt::Debug for QueryWatcher<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryWatcher")
            .field("id", &self.inner.id)
            .field("operation", &self.inner.operation.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<O: Operation> QueryWatcher<O> {
    pub(crate) fn new(core: Arc<ClientCore>, operation: Arc<O>, mut options: CallOptions) -> Self {
        // Only the first call carries one-shot options.
        options.optimistic_updates = None;
        options.refetch_queries.clear();
        options.refetch_query_names.clear();
        let refetch_policy = core.config.refetch_policy;
        let inner = Arc::new_cyclic(|this| WatcherInner {
            id: NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed),
            this: this.clone(),
            core,
            operation,
            options,
            state: Mutex::new(WatcherState {
                state: CallState::Idle,
                refetch_policy,
                generation: 0,
                active_call: None,
                subscription: None,
                sender: None,
            }),
        });
        Self { inner }
    }

    /// Policy used when the watcher refetches. Defaults to the client's
    /// configured refetch policy.
    pub fn refetch_policy(self, policy: FetchPolicy) -> Self {
        self.inner.lock_state().refetch_policy = policy;
        self
    }

    pub fn operation(&self) -> &O {
        &self.inner.operation
    }

    pub fn state(&self) -> CallState {
        self.inner.lock_state().state
    }

    /// Start watching. Fails if already started, canceled or terminated.
    pub fn watch(&self) -> StrataResult<WatchStream<O::Data>> {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        state.state.activate(inner.operation.name())?;

        let (tx, rx) = mpsc::unbounded_channel();
        state.sender = Some(tx);
        let refetchable: Weak<dyn Refetchable> = inner.this.clone();
        inner
            .core
            .tracker
            .register_watcher(inner.operation.name(), inner.id, refetchable);

        if let Err(error) = inner.start_call(&mut state, inner.options.fetch_policy) {
            inner.terminate(&mut state, CallState::Terminated);
            return Err(error);
        }
        Ok(WatchStream { rx })
    }

    /// Cancel the in-flight call and fetch again with the refetch policy.
    pub fn refetch(&self) -> StrataResult<()> {
        self.inner.refetch_now()
    }

    /// Stop watching. Idempotent.
    pub fn cancel(&self) {
        let mut state = self.inner.lock_state();
        match state.state {
            CallState::Active => self.inner.terminate(&mut state, CallState::Canceled),
            CallState::Idle => state.state = CallState::Canceled,
            CallState::Canceled | CallState::Terminated => {}
        }
    }
}

impl<O: Operation> WatcherInner<O> {
    fn lock_state(&self) -> MutexGuard<'_, WatcherState<O>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_call(&self, state: &mut WatcherState<O>, policy: FetchPolicy) -> StrataResult<()> {
        state.generation += 1;
        let generation = state.generation;

        let mut options = self.options.clone();
        options.fetch_policy = policy;
        let call = Call::with_options(self.core.clone(), self.operation.clone(), options);
        let stream = call.execute()?;
        state.active_call = Some(call);

        tracing::debug!(
            watcher = self.id,
            operation = self.operation.name(),
            generation,
            policy = %policy,
            "watcher fetching"
        );
        self.core
            .dispatcher
            .spawn(Self::forward(self.this.clone(), generation, stream));
        Ok(())
    }

    async fn forward(this: Weak<Self>, generation: u64, mut stream: ResponseStream<O::Data>) {
        while let Some(event) = stream.next_event().await {
            let Some(inner) = this.upgrade() else {
                return;
            };
            if !inner.deliver(generation, event) {
                return;
            }
        }
    }

    /// Hand one call event to the watcher. Returns `false` once the event
    /// stream is no longer wanted.
    fn deliver(&self, generation: u64, event: CallEvent<O::Data>) -> bool {
        let mut state = self.lock_state();
        if state.generation != generation || state.state != CallState::Active {
            return false;
        }
        match event {
            CallEvent::Response(response) => {
                self.track_keys(&mut state, response.dependent_keys.clone());
                if let Some(sender) = &state.sender {
                    let _ = sender.send(Ok(response));
                }
                true
            }
            CallEvent::Failure(error) => {
                tracing::debug!(watcher = self.id, error = %error, "watcher terminated by failure");
                if let Some(sender) = &state.sender {
                    let _ = sender.send(Err(error));
                }
                self.terminate(&mut state, CallState::Terminated);
                false
            }
            CallEvent::Fetch(_) | CallEvent::Completed => true,
        }
    }

    fn track_keys(&self, state: &mut WatcherState<O>, dependent_keys: HashSet<String>) {
        let store = &self.core.store;
        match state.subscription {
            Some(id) => store.update_subscription(id, dependent_keys),
            None => {
                let subscriber = Arc::new(WatcherSubscriber {
                    inner: self.this.clone(),
                });
                state.subscription = Some(store.subscribe(dependent_keys, subscriber));
            }
        }
    }

    fn refetch_now(&self) -> StrataResult<()> {
        let mut state = self.lock_state();
        match state.state {
            CallState::Active => {}
            CallState::Idle => {
                return Err(StrataError::illegal_state(
                    "Cannot refetch a watcher that has not been started",
                ))
            }
            CallState::Canceled => {
                return Err(StrataError::Canceled {
                    operation: self.operation.name().to_string(),
                })
            }
            CallState::Terminated => {
                return Err(StrataError::illegal_state("Cannot refetch a terminated watcher"))
            }
        }
        // Unsubscribed until the new response arrives, so this watcher's own
        // cache write cannot trigger another refetch.
        if let Some(id) = state.subscription.take() {
            self.core.store.unsubscribe(id);
        }
        if let Some(call) = state.active_call.take() {
            call.cancel();
        }
        let policy = state.refetch_policy;
        let started = self.start_call(&mut state, policy);
        if started.is_err() {
            self.terminate(&mut state, CallState::Terminated);
        }
        started
    }

    fn terminate(&self, state: &mut WatcherState<O>, final_state: CallState) {
        state.state = final_state;
        state.sender = None;
        if let Some(call) = state.active_call.take() {
            call.cancel();
        }
        if let Some(id) = state.subscription.take() {
            self.core.store.unsubscribe(id);
        }
        self.core
            .tracker
            .unregister_watcher(self.operation.name(), self.id);
    }
}

impl<O: Operation> Refetchable for WatcherInner<O> {
    fn refetch(&self) -> StrataResult<()> {
        self.refetch_now()
    }
}

impl<O: Operation> Drop for WatcherInner<O> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(call) = state.active_call.take() {
            call.cancel();
        }
        if let Some(id) = state.subscription.take() {
            self.core.store.unsubscribe(id);
        }
        self.core
            .tracker
            .unregister_watcher(self.operation.name(), self.id);
    }
}

struct WatcherSubscriber<O: Operation> {
    inner: Weak<WatcherInner<O>>,
}

impl<O: Operation> RecordChangeSubscriber for WatcherSubscriber<O> {
    fn on_records_changed(&self, changed_keys: &HashSet<String>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        tracing::debug!(
            watcher = inner.id,
            changed = changed_keys.len(),
            "dependent records changed"
        );
        if let Err(error) = inner.refetch_now() {
            tracing::debug!(watcher = inner.id, error = %error, "watcher refetch skipped");
        }
    }
}
