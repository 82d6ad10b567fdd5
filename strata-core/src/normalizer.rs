//! Response normalization.
//!
//! Consumes the [`ResponseWalker`] event stream and flattens the tree into a
//! [`RecordSet`]. Every non-null object becomes its own record:
//! - objects with an identity key are stored at that key and restart the path;
//! - other objects are stored at their dot-joined response path
//!   (`hero`, `hero.friends.0`).
//!
//! The parent field holds a [`CacheReference`](crate::record::CacheReference)
//! either way, so records never nest.

use crate::error::{StrataError, StrataResult};
use crate::key::{resolve_object_key, CacheKey, CacheKeyBuilder, CacheKeyResolver};
use crate::operation::{OperationDescriptor, ResponseField, Variables};
use crate::record::{field_path, FieldValue, RecordBuilder, RecordSet};
use crate::walker::{ResolveEvent, ResponseWalker};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Output of one normalization pass.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub records: RecordSet,
    /// Every record key and `recordKey.fieldKey` written by the pass.
    pub dependent_keys: HashSet<String>,
}

#[derive(Clone)]
pub struct ResponseNormalizer {
    resolver: Arc<dyn CacheKeyResolver>,
    key_builder: Arc<dyn CacheKeyBuilder>,
    mutation_id: Option<Uuid>,
}

impl std::fmt::Debug for ResponseNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseNormalizer")
            .field("mutation_id", &self.mutation_id)
            .finish_non_exhaustive()
    }
}

impl ResponseNormalizer {
    pub fn new(resolver: Arc<dyn CacheKeyResolver>, key_builder: Arc<dyn CacheKeyBuilder>) -> Self {
        Self {
            resolver,
            key_builder,
            mutation_id: None,
        }
    }

    /// Tag every record produced by this normalizer.
    pub fn with_mutation_id(mut self, mutation_id: Option<Uuid>) -> Self {
        self.mutation_id = mutation_id;
        self
    }

    pub fn resolver(&self) -> &Arc<dyn CacheKeyResolver> {
        &self.resolver
    }

    pub fn key_builder(&self) -> &Arc<dyn CacheKeyBuilder> {
        &self.key_builder
    }

    /// Normalize the `data` member of an operation's response.
    ///
    /// `null` data normalizes to nothing.
    pub fn normalize_operation(
        &self,
        operation: &dyn OperationDescriptor,
        data: &Value,
    ) -> StrataResult<Normalized> {
        match data {
            Value::Null => Ok(Normalized::default()),
            Value::Object(object) => self.normalize(
                operation.root_key(),
                operation.selections(),
                &operation.variables(),
                object,
            ),
            other => Err(StrataError::parse(format!(
                "expected object as data of {}, got {}",
                operation.name(),
                other
            ))),
        }
    }

    /// Normalize a data tree rooted at an operation root key.
    pub fn normalize(
        &self,
        root_key: &str,
        selections: &[ResponseField],
        variables: &Variables,
        data: &Map<String, Value>,
    ) -> StrataResult<Normalized> {
        self.run(root_key, Vec::new(), selections, variables, data)
    }

    /// Normalize a selection set rooted at an arbitrary record key.
    ///
    /// Unlike operation roots, nested path-keyed records are prefixed with
    /// `record_key` so they cannot collide with other fragments.
    pub fn normalize_fragment(
        &self,
        record_key: &str,
        selections: &[ResponseField],
        variables: &Variables,
        data: &Map<String, Value>,
    ) -> StrataResult<Normalized> {
        self.run(
            record_key,
            vec![record_key.to_string()],
            selections,
            variables,
            data,
        )
    }

    fn run(
        &self,
        root_key: &str,
        root_path: Vec<String>,
        selections: &[ResponseField],
        variables: &Variables,
        data: &Map<String, Value>,
    ) -> StrataResult<Normalized> {
        let mut pass = Pass::new(root_key, root_path);

        for event in ResponseWalker::new(selections, variables, data) {
            match event? {
                ResolveEvent::EnterField(field) => {
                    pass.path.push(self.key_builder.build(field, variables));
                }
                ResolveEvent::ExitField(_) => pass.exit_field()?,
                ResolveEvent::Scalar(value) => {
                    pass.values.push(FieldValue::from_scalar_json(value.clone()));
                }
                ResolveEvent::Null => pass.values.push(FieldValue::Null),
                ResolveEvent::EnterObject { field, object } => {
                    let key = resolve_object_key(self.resolver.as_ref(), field, object);
                    pass.enter_object(key);
                }
                ResolveEvent::ExitObject(_) => pass.exit_object()?,
                ResolveEvent::EnterList { .. } => {}
                ResolveEvent::ExitList { len, .. } => pass.exit_list(len)?,
                ResolveEvent::EnterElement(index) => pass.path.push(index.to_string()),
                ResolveEvent::ExitElement(_) => {
                    pass.path.pop();
                }
            }
        }

        pass.finish(self.mutation_id)
    }
}

/// Traversal state of one pass. Builders live in an index-addressed arena
/// and are frozen into the record set when the pass ends.
struct Pass {
    path: Vec<String>,
    saved_paths: Vec<Vec<String>>,
    arena: Vec<RecordBuilder>,
    open: Vec<usize>,
    values: Vec<FieldValue>,
    dependent_keys: HashSet<String>,
}

impl Pass {
    fn new(root_key: &str, root_path: Vec<String>) -> Self {
        Self {
            path: root_path,
            saved_paths: Vec::new(),
            arena: vec![RecordBuilder::new(root_key)],
            open: vec![0],
            values: Vec::new(),
            dependent_keys: HashSet::new(),
        }
    }

    fn current(&mut self) -> StrataResult<&mut RecordBuilder> {
        let index = *self
            .open
            .last()
            .ok_or_else(|| StrataError::parse("no open record"))?;
        Ok(&mut self.arena[index])
    }

    fn enter_object(&mut self, key: CacheKey) {
        let record_key = match key {
            CacheKey::Key(key) => {
                let nested = std::mem::replace(&mut self.path, vec![key.clone()]);
                self.saved_paths.push(nested);
                key
            }
            CacheKey::NoKey => {
                self.saved_paths.push(self.path.clone());
                self.path.join(".")
            }
        };
        self.arena.push(RecordBuilder::new(record_key));
        self.open.push(self.arena.len() - 1);
    }

    fn exit_object(&mut self) -> StrataResult<()> {
        let index = self
            .open
            .pop()
            .ok_or_else(|| StrataError::parse("object exit without entry"))?;
        self.path = self
            .saved_paths
            .pop()
            .ok_or_else(|| StrataError::parse("object exit without saved path"))?;
        let record_key = self.arena[index].key().to_string();
        self.values.push(FieldValue::reference(record_key.clone()));
        self.dependent_keys.insert(record_key);
        Ok(())
    }

    fn exit_list(&mut self, len: usize) -> StrataResult<()> {
        if self.values.len() < len {
            return Err(StrataError::parse("list exit with missing element values"));
        }
        let items = self.values.split_off(self.values.len() - len);
        self.values.push(FieldValue::List(items));
        Ok(())
    }

    fn exit_field(&mut self) -> StrataResult<()> {
        let field_key = self
            .path
            .pop()
            .ok_or_else(|| StrataError::parse("field exit with empty path"))?;
        let value = self
            .values
            .pop()
            .ok_or_else(|| StrataError::parse("field exit without value"))?;
        let builder = self.current()?;
        let dependent = field_path(builder.key(), &field_key);
        builder.add_field(field_key, value);
        self.dependent_keys.insert(dependent);
        Ok(())
    }

    fn finish(mut self, mutation_id: Option<Uuid>) -> StrataResult<Normalized> {
        if self.open.len() != 1 || !self.values.is_empty() {
            return Err(StrataError::parse("unbalanced response events"));
        }
        let mut records = RecordSet::new();
        for builder in self.arena {
            self.dependent_keys.insert(builder.key().to_string());
            records.merge(builder.mutation_id(mutation_id).build());
        }
        Ok(Normalized {
            records,
            dependent_keys: self.dependent_keys,
        })
    }
}
