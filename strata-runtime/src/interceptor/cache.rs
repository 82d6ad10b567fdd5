//! Store-facing stage: serves cache reads, applies and rolls back optimistic
//! updates, and writes network results.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use strata_core::{FetchSource, RecordSet, StrataResult};
use strata_storage::{Store, StoreExt};
use tokio::runtime::Handle;
use uuid::Uuid;

use super::{
    EventSink, Interceptor, InterceptorChain, InterceptorEvent, InterceptorRequest,
    InterceptorResponse,
};

pub struct CacheInterceptor {
    store: Arc<dyn Store>,
    dispatcher: Handle,
    write_asynchronously: bool,
    /// Optimistic patch applied and not yet committed or rolled back.
    pending: Mutex<Option<Uuid>>,
}

impl CacheInterceptor {
    pub fn new(store: Arc<dyn Store>, dispatcher: Handle) -> Self {
        Self {
            store,
            dispatcher,
            write_asynchronously: false,
            pending: Mutex::new(None),
        }
    }

    fn set_pending(&self, mutation_id: Option<Uuid>) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = mutation_id;
    }

    /// Merge network results on a separate task instead of before the
    /// response is delivered.
    pub fn write_asynchronously(mut self, enabled: bool) -> Self {
        self.write_asynchronously = enabled;
        self
    }

    async fn read(&self, request: &InterceptorRequest, sink: &EventSink) {
        sink.on_fetch(FetchSource::Cache);
        match self.store.read(request.operation.as_ref(), &request.cache_headers).await {
            Ok(read) => {
                sink.on_response(InterceptorResponse::from_cache(read));
                sink.on_completed();
            }
            Err(error) => {
                tracing::debug!(
                    operation = request.operation.name(),
                    error = %error,
                    "cache read failed"
                );
                sink.on_failure(error);
            }
        }
    }

    /// Records to commit for a network response. Responses carrying errors
    /// are only stored when partial responses are allowed.
    fn records_to_commit(request: &InterceptorRequest, response: &InterceptorResponse) -> RecordSet {
        if request.cache_headers.do_not_store() {
            return RecordSet::new();
        }
        if !response.errors.is_empty() && !request.cache_headers.store_partial_responses() {
            tracing::debug!(
                operation = request.operation.name(),
                errors = response.errors.len(),
                "response has errors, skipping cache write"
            );
            return RecordSet::new();
        }
        let mut records = response.records.clone().unwrap_or_default();
        records.tag(Some(request.unique_id));
        records
    }

    async fn commit(
        store: &dyn Store,
        request: &InterceptorRequest,
        records: RecordSet,
    ) -> StrataResult<()> {
        let changed = store
            .commit_network_result(records, request.unique_id, &request.cache_headers)
            .await?;
        tracing::trace!(
            operation = request.operation.name(),
            changed = changed.len(),
            "committed network result"
        );
        store.publish(&changed);
        Ok(())
    }

    async fn rollback(&self, mutation_id: Uuid) {
        if let Err(error) = self.store.rollback_and_publish(mutation_id).await {
            tracing::warn!(%mutation_id, error = %error, "failed to roll back optimistic updates");
        }
    }
}

#[async_trait]
impl Interceptor for CacheInterceptor {
    async fn intercept(&self, request: InterceptorRequest, chain: InterceptorChain, sink: EventSink) {
        if request.fetch_from_cache {
            self.read(&request, &sink).await;
            return;
        }

        if let Some(updates) = &request.optimistic_updates {
            if let Err(error) = self
                .store
                .apply_optimistic(request.operation.as_ref(), updates, request.unique_id)
                .await
            {
                tracing::warn!(
                    operation = request.operation.name(),
                    error = %error,
                    "failed to apply optimistic updates"
                );
            }
            self.set_pending(Some(request.unique_id));
        }

        let mut upstream = chain.proceed(request.clone());
        while let Some(event) = upstream.next().await {
            match event {
                InterceptorEvent::Response(response) => {
                    let records = Self::records_to_commit(&request, &response);
                    if self.write_asynchronously {
                        let store = self.store.clone();
                        let request = request.clone();
                        self.dispatcher.spawn(async move {
                            if let Err(error) = Self::commit(store.as_ref(), &request, records).await {
                                tracing::warn!(
                                    operation = request.operation.name(),
                                    error = %error,
                                    "asynchronous cache write failed"
                                );
                            }
                        });
                        self.set_pending(None);
                        sink.on_response(*response);
                    } else {
                        // The patch stays pending until the commit has rolled
                        // it back, so a cancel mid-commit still owes a rollback.
                        let committed = Self::commit(self.store.as_ref(), &request, records).await;
                        self.set_pending(None);
                        match committed {
                            Ok(()) => sink.on_response(*response),
                            Err(error) => {
                                sink.on_failure(error);
                                return;
                            }
                        }
                    }
                }
                InterceptorEvent::Failure(error) => {
                    self.set_pending(None);
                    self.rollback(request.unique_id).await;
                    sink.on_failure(error);
                    return;
                }
                InterceptorEvent::Completed => {
                    sink.on_completed();
                    return;
                }
                InterceptorEvent::Fetch(source) => sink.on_fetch(source),
            }
        }
        // Upstream went away without a terminal event.
        self.set_pending(None);
        self.rollback(request.unique_id).await;
    }

    /// A call canceled mid-flight still owes the store its rollback.
    fn dispose(&self) {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mutation_id) = pending {
            let store = self.store.clone();
            self.dispatcher.spawn(async move {
                if let Err(error) = store.rollback_and_publish(mutation_id).await {
                    tracing::warn!(%mutation_id, error = %error, "failed to roll back canceled call");
                }
            });
        }
    }
}
