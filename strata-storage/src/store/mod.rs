//! Store facade.
//!
//! The [`Store`] trait is the only way the runtime touches records. It is
//! object safe and works on JSON data trees; [`StoreExt`] adds typed
//! helpers for [`Operation`]s.

mod noop;
mod normalized;
mod subscribers;

pub use noop::NoOpStore;
pub use normalized::NormalizedStore;
pub use subscribers::{keys_intersect, RecordChangeSubscriber, SubscriberRegistry, SubscriptionId};

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use strata_core::{
    CacheHeaders, FetchSource, Operation, OperationDescriptor, RecordSet, Response,
    ResponseField, ResponseNormalizer, StrataError, StrataResult, Variables,
};
use uuid::Uuid;

use crate::reader::CacheRead;

/// Transactional access to the normalized records plus change notification.
#[async_trait]
pub trait Store: Send + Sync {
    /// Rebuild an operation's data from the store.
    async fn read(
        &self,
        operation: &dyn OperationDescriptor,
        headers: &CacheHeaders,
    ) -> StrataResult<CacheRead>;

    /// Rebuild a selection set rooted at an arbitrary record.
    async fn read_fragment(
        &self,
        record_key: &str,
        selections: &[ResponseField],
        variables: &Variables,
    ) -> StrataResult<CacheRead>;

    /// Normalize and merge an operation's data. Does not publish.
    async fn write(
        &self,
        operation: &dyn OperationDescriptor,
        data: &Value,
        headers: &CacheHeaders,
    ) -> StrataResult<HashSet<String>>;

    /// Normalize and merge a selection set rooted at `record_key`. Does not publish.
    async fn write_fragment(
        &self,
        record_key: &str,
        selections: &[ResponseField],
        variables: &Variables,
        data: &Value,
    ) -> StrataResult<HashSet<String>>;

    /// Apply speculative data tagged with `mutation_id` and publish the
    /// changed keys immediately.
    async fn apply_optimistic(
        &self,
        operation: &dyn OperationDescriptor,
        data: &Value,
        mutation_id: Uuid,
    ) -> StrataResult<HashSet<String>>;

    /// Undo every patch tagged with `mutation_id`. Idempotent. Does not publish.
    async fn rollback(&self, mutation_id: Uuid) -> StrataResult<HashSet<String>>;

    /// Roll back the request's optimistic patch, then merge its network
    /// records, in one write transaction. Returns the union of both change
    /// sets for a single publish.
    ///
    /// If the merge fails the rollback keys are published before the error
    /// is returned.
    async fn commit_network_result(
        &self,
        records: RecordSet,
        mutation_id: Uuid,
        headers: &CacheHeaders,
    ) -> StrataResult<HashSet<String>>;

    /// Notify every subscriber whose dependent keys intersect `changed_keys`.
    fn publish(&self, changed_keys: &HashSet<String>);

    fn subscribe(
        &self,
        dependent_keys: HashSet<String>,
        subscriber: Arc<dyn RecordChangeSubscriber>,
    ) -> SubscriptionId;

    fn update_subscription(&self, id: SubscriptionId, dependent_keys: HashSet<String>);

    fn unsubscribe(&self, id: SubscriptionId);

    async fn remove(&self, key: &str, cascade: bool) -> StrataResult<bool>;

    /// Remove several records without cascading. Returns how many existed.
    async fn remove_all(&self, keys: &[String]) -> StrataResult<usize>;

    async fn clear_all(&self) -> StrataResult<()>;

    /// Normalizer configured with this store's resolver and key builder.
    fn normalizer(&self) -> ResponseNormalizer;

    /// `false` for the no-op store.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Typed helpers over any [`Store`].
#[async_trait]
pub trait StoreExt: Store {
    /// Read and decode an operation's data from the store.
    async fn read_operation<O: Operation>(
        &self,
        operation: &O,
        headers: &CacheHeaders,
    ) -> StrataResult<Response<O::Data>> {
        let read = self.read(operation, headers).await?;
        Ok(Response {
            operation_name: operation.name().to_string(),
            data: Some(operation.parse_data(read.data)?),
            errors: Vec::new(),
            dependent_keys: read.dependent_keys,
            source: FetchSource::Cache,
            extensions: Default::default(),
        })
    }

    /// Write typed data without publishing.
    async fn write_operation<O: Operation>(
        &self,
        operation: &O,
        data: &O::Data,
    ) -> StrataResult<HashSet<String>> {
        let value = to_json(data)?;
        self.write(operation, &value, &CacheHeaders::none()).await
    }

    /// Write typed data and publish the changed keys.
    async fn write_and_publish<O: Operation>(
        &self,
        operation: &O,
        data: &O::Data,
    ) -> StrataResult<HashSet<String>> {
        let changed = self.write_operation(operation, data).await?;
        self.publish(&changed);
        Ok(changed)
    }

    async fn rollback_and_publish(&self, mutation_id: Uuid) -> StrataResult<HashSet<String>> {
        let changed = self.rollback(mutation_id).await?;
        self.publish(&changed);
        Ok(changed)
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// Serialize typed data into the JSON tree the store works on.
pub fn to_json<T: serde::Serialize>(data: &T) -> StrataResult<Value> {
    serde_json::to_value(data)
        .map_err(|e| StrataError::parse(format!("failed to encode data: {e}")))
}
