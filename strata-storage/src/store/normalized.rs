//! Store facade over an optimistic record cache.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use strata_core::{
    CacheHeaders, CacheKeyBuilder, CacheKeyResolver, DefaultCacheKeyBuilder, OperationDescriptor,
    RecordSet, ResponseField, ResponseNormalizer, StrataConfig, StrataError, StrataResult,
    Variables,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::subscribers::{RecordChangeSubscriber, SubscriberRegistry, SubscriptionId};
use super::Store;
use crate::cache::{EvictionPolicy, LruNormalizedCache, NormalizedCache, OptimisticCache};
use crate::reader::{CacheRead, CacheReader};

/// The normalized store.
///
/// One reader/writer lock guards every cache access: reads share it, any
/// merge, removal or rollback holds it exclusively, so no reader sees a
/// partially applied write.
pub struct NormalizedStore {
    cache: OptimisticCache,
    resolver: Arc<dyn CacheKeyResolver>,
    key_builder: Arc<dyn CacheKeyBuilder>,
    lock: RwLock<()>,
    subscribers: SubscriberRegistry,
}

impl NormalizedStore {
    pub fn new(cache: Arc<dyn NormalizedCache>, resolver: Arc<dyn CacheKeyResolver>) -> Self {
        Self {
            cache: OptimisticCache::new(cache),
            resolver,
            key_builder: Arc::new(DefaultCacheKeyBuilder),
            lock: RwLock::new(()),
            subscribers: SubscriberRegistry::new(),
        }
    }

    /// Store backed by an LRU cache bounded per the configuration.
    pub fn from_config(config: &StrataConfig, resolver: Arc<dyn CacheKeyResolver>) -> Self {
        let cache = LruNormalizedCache::new(EvictionPolicy::from(&config.eviction));
        Self::new(Arc::new(cache), resolver)
    }

    pub fn with_key_builder(mut self, key_builder: Arc<dyn CacheKeyBuilder>) -> Self {
        self.key_builder = key_builder;
        self
    }

    pub fn cache(&self) -> &OptimisticCache {
        &self.cache
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Run `f` with shared access to the records.
    pub async fn read_transaction<R>(
        &self,
        f: impl FnOnce(&OptimisticCache) -> StrataResult<R>,
    ) -> StrataResult<R> {
        let _guard = self.lock.read().await;
        f(&self.cache)
    }

    /// Run `f` with exclusive access to the records.
    pub async fn write_transaction<R>(
        &self,
        f: impl FnOnce(&OptimisticCache) -> StrataResult<R>,
    ) -> StrataResult<R> {
        let _guard = self.lock.write().await;
        f(&self.cache)
    }

    fn reader<'a>(&'a self, headers: &'a CacheHeaders, operation_name: &'a str) -> CacheReader<'a> {
        CacheReader::new(
            &self.cache,
            self.key_builder.as_ref(),
            self.resolver.as_ref(),
            headers,
            operation_name,
        )
    }
}

fn object_of<'v>(data: &'v Value, what: &str) -> StrataResult<Option<&'v serde_json::Map<String, Value>>> {
    match data {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        other => Err(StrataError::parse(format!(
            "expected object as data of {what}, got {other}"
        ))),
    }
}

#[async_trait]
impl Store for NormalizedStore {
    async fn read(
        &self,
        operation: &dyn OperationDescriptor,
        headers: &CacheHeaders,
    ) -> StrataResult<CacheRead> {
        let variables = operation.variables();
        self.read_transaction(|_| {
            self.reader(headers, operation.name())
                .read(operation.root_key(), operation.selections(), &variables)
        })
        .await
    }

    async fn read_fragment(
        &self,
        record_key: &str,
        selections: &[ResponseField],
        variables: &Variables,
    ) -> StrataResult<CacheRead> {
        let headers = CacheHeaders::none();
        self.read_transaction(|_| {
            self.reader(&headers, record_key)
                .read(record_key, selections, variables)
        })
        .await
    }

    async fn write(
        &self,
        operation: &dyn OperationDescriptor,
        data: &Value,
        headers: &CacheHeaders,
    ) -> StrataResult<HashSet<String>> {
        let normalized = self.normalizer().normalize_operation(operation, data)?;
        let records = normalized.records.into_records();
        let changed = self
            .write_transaction(|cache| cache.merge_all(records, headers))
            .await?;
        Ok(changed.into_iter().collect())
    }

    async fn write_fragment(
        &self,
        record_key: &str,
        selections: &[ResponseField],
        variables: &Variables,
        data: &Value,
    ) -> StrataResult<HashSet<String>> {
        let Some(object) = object_of(data, record_key)? else {
            return Ok(HashSet::new());
        };
        let normalized = self
            .normalizer()
            .normalize_fragment(record_key, selections, variables, object)?;
        let records = normalized.records.into_records();
        let changed = self
            .write_transaction(|cache| cache.merge_all(records, &CacheHeaders::none()))
            .await?;
        Ok(changed.into_iter().collect())
    }

    async fn apply_optimistic(
        &self,
        operation: &dyn OperationDescriptor,
        data: &Value,
        mutation_id: Uuid,
    ) -> StrataResult<HashSet<String>> {
        let normalized = self
            .normalizer()
            .with_mutation_id(Some(mutation_id))
            .normalize_operation(operation, data)?;
        let records = normalized.records.into_records();
        let changed: HashSet<String> = self
            .write_transaction(|cache| cache.merge_optimistic(records))
            .await?
            .into_iter()
            .collect();
        tracing::debug!(mutation_id = %mutation_id, changed = changed.len(), "applied optimistic update");
        self.publish(&changed);
        Ok(changed)
    }

    async fn rollback(&self, mutation_id: Uuid) -> StrataResult<HashSet<String>> {
        let changed = self
            .write_transaction(|cache| cache.rollback(mutation_id))
            .await?;
        Ok(changed.into_iter().collect())
    }

    async fn commit_network_result(
        &self,
        records: RecordSet,
        mutation_id: Uuid,
        headers: &CacheHeaders,
    ) -> StrataResult<HashSet<String>> {
        let mut rolled_back = HashSet::new();
        let outcome = self
            .write_transaction(|cache| {
                rolled_back.extend(cache.rollback(mutation_id)?);
                cache.merge_all(records.into_records(), headers)
            })
            .await;

        match outcome {
            Ok(merged) => {
                rolled_back.extend(merged);
                Ok(rolled_back)
            }
            Err(e) => {
                tracing::warn!(error = %e, mutation_id = %mutation_id, "merge failed after rollback");
                self.publish(&rolled_back);
                Err(e)
            }
        }
    }

    fn publish(&self, changed_keys: &HashSet<String>) {
        self.subscribers.publish(changed_keys);
    }

    fn subscribe(
        &self,
        dependent_keys: HashSet<String>,
        subscriber: Arc<dyn RecordChangeSubscriber>,
    ) -> SubscriptionId {
        self.subscribers.subscribe(dependent_keys, subscriber)
    }

    fn update_subscription(&self, id: SubscriptionId, dependent_keys: HashSet<String>) {
        self.subscribers.update(id, dependent_keys);
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.unsubscribe(id);
    }

    async fn remove(&self, key: &str, cascade: bool) -> StrataResult<bool> {
        self.write_transaction(|cache| cache.remove(key, cascade))
            .await
    }

    async fn remove_all(&self, keys: &[String]) -> StrataResult<usize> {
        self.write_transaction(|cache| {
            let mut removed = 0;
            for key in keys {
                if cache.remove(key, false)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
    }

    async fn clear_all(&self) -> StrataResult<()> {
        self.write_transaction(|cache| cache.clear_all()).await
    }

    fn normalizer(&self) -> ResponseNormalizer {
        ResponseNormalizer::new(self.resolver.clone(), self.key_builder.clone())
    }
}
