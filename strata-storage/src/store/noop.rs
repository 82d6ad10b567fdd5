//! Stateless store used when caching is disabled.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use strata_core::{
    CacheHeaders, DefaultCacheKeyBuilder, NoKeyResolver, OperationDescriptor, RecordSet,
    ResponseField, ResponseNormalizer, StrataError, StrataResult, Variables,
};
use uuid::Uuid;

use super::subscribers::{RecordChangeSubscriber, SubscriptionId};
use super::Store;
use crate::reader::CacheRead;

/// Every read misses, every write reports no changes, nothing is notified.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpStore;

impl NoOpStore {
    fn miss(name: &str) -> StrataError {
        StrataError::cache_miss(name, "normalized store is disabled")
    }
}

#[async_trait]
impl Store for NoOpStore {
    async fn read(
        &self,
        operation: &dyn OperationDescriptor,
        _headers: &CacheHeaders,
    ) -> StrataResult<CacheRead> {
        Err(Self::miss(operation.name()))
    }

    async fn read_fragment(
        &self,
        record_key: &str,
        _selections: &[ResponseField],
        _variables: &Variables,
    ) -> StrataResult<CacheRead> {
        Err(Self::miss(record_key))
    }

    async fn write(
        &self,
        _operation: &dyn OperationDescriptor,
        _data: &Value,
        _headers: &CacheHeaders,
    ) -> StrataResult<HashSet<String>> {
        Ok(HashSet::new())
    }

    async fn write_fragment(
        &self,
        _record_key: &str,
        _selections: &[ResponseField],
        _variables: &Variables,
        _data: &Value,
    ) -> StrataResult<HashSet<String>> {
        Ok(HashSet::new())
    }

    async fn apply_optimistic(
        &self,
        _operation: &dyn OperationDescriptor,
        _data: &Value,
        _mutation_id: Uuid,
    ) -> StrataResult<HashSet<String>> {
        Ok(HashSet::new())
    }

    async fn rollback(&self, _mutation_id: Uuid) -> StrataResult<HashSet<String>> {
        Ok(HashSet::new())
    }

    async fn commit_network_result(
        &self,
        _records: RecordSet,
        _mutation_id: Uuid,
        _headers: &CacheHeaders,
    ) -> StrataResult<HashSet<String>> {
        Ok(HashSet::new())
    }

    fn publish(&self, _changed_keys: &HashSet<String>) {}

    fn subscribe(
        &self,
        _dependent_keys: HashSet<String>,
        _subscriber: Arc<dyn RecordChangeSubscriber>,
    ) -> SubscriptionId {
        0
    }

    fn update_subscription(&self, _id: SubscriptionId, _dependent_keys: HashSet<String>) {}

    fn unsubscribe(&self, _id: SubscriptionId) {}

    async fn remove(&self, _key: &str, _cascade: bool) -> StrataResult<bool> {
        Ok(false)
    }

    async fn remove_all(&self, _keys: &[String]) -> StrataResult<usize> {
        Ok(0)
    }

    async fn clear_all(&self) -> StrataResult<()> {
        Ok(())
    }

    fn normalizer(&self) -> ResponseNormalizer {
        ResponseNormalizer::new(Arc::new(NoKeyResolver), Arc::new(DefaultCacheKeyBuilder))
    }

    fn is_enabled(&self) -> bool {
        false
    }
}
