//! Rebuilds response data from normalized records.
//!
//! The inverse of normalization: walk the selection set from a root record,
//! following references, and assemble a JSON tree. Every field actually
//! read is recorded as a dependent key. A missing record or field is a
//! cache miss; an explicit null comes back as null.
//!
//! Traversal uses a task stack. Containers are allocated in an
//! index-addressed arena as they are discovered and attached to their
//! parents once the walk is over, children before parents.

use std::collections::HashSet;

use serde_json::{Map, Value};
use strata_core::{
    collect_fields, field_path, resolve_argument_key, CacheHeaders, CacheKey, CacheKeyBuilder,
    CacheKeyResolver, FieldType, FieldValue, Record, ResponseField, StrataError, StrataResult,
    Variables,
};

use crate::cache::NormalizedCache;

/// Data rebuilt from the store together with the keys it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
    pub data: Value,
    pub dependent_keys: HashSet<String>,
}

#[derive(Debug, Clone)]
enum Slot {
    Field(usize, String),
    Element(usize, usize),
}

enum Task<'s> {
    Object {
        record: Record,
        selections: &'s [ResponseField],
        node: usize,
    },
    Value {
        record_key: String,
        field: &'s ResponseField,
        field_type: &'s FieldType,
        value: FieldValue,
        slot: Slot,
    },
}

pub struct CacheReader<'a> {
    cache: &'a dyn NormalizedCache,
    key_builder: &'a dyn CacheKeyBuilder,
    resolver: &'a dyn CacheKeyResolver,
    headers: &'a CacheHeaders,
    operation_name: &'a str,
}

impl<'a> CacheReader<'a> {
    pub fn new(
        cache: &'a dyn NormalizedCache,
        key_builder: &'a dyn CacheKeyBuilder,
        resolver: &'a dyn CacheKeyResolver,
        headers: &'a CacheHeaders,
        operation_name: &'a str,
    ) -> Self {
        Self {
            cache,
            key_builder,
            resolver,
            headers,
            operation_name,
        }
    }

    fn miss(&self, reason: String) -> StrataError {
        StrataError::cache_miss(self.operation_name, reason)
    }

    fn load(&self, key: &str) -> StrataResult<Record> {
        self.cache
            .load_record(key, self.headers)?
            .ok_or_else(|| self.miss(format!("missing record {key}")))
    }

    /// Read `selections` starting at the record stored under `root_key`.
    pub fn read(
        &self,
        root_key: &str,
        selections: &[ResponseField],
        variables: &Variables,
    ) -> StrataResult<CacheRead> {
        let mut dependent_keys = HashSet::new();
        let mut nodes: Vec<(Value, Option<Slot>)> = vec![(Value::Object(Map::new()), None)];
        let mut tasks = vec![Task::Object {
            record: self.load(root_key)?,
            selections,
            node: 0,
        }];
        dependent_keys.insert(root_key.to_string());

        while let Some(task) = tasks.pop() {
            match task {
                Task::Object {
                    record,
                    selections,
                    node,
                } => {
                    let typename = match record.field("__typename") {
                        Some(FieldValue::Scalar(Value::String(t))) => Some(t.as_str()),
                        _ => None,
                    };
                    for field in collect_fields(selections, typename, variables) {
                        let value = self.field_value(&record, field, variables, &mut dependent_keys)?;
                        tasks.push(Task::Value {
                            record_key: record.key().to_string(),
                            field,
                            field_type: &field.field_type,
                            value,
                            slot: Slot::Field(node, field.response_name.clone()),
                        });
                    }
                }
                Task::Value {
                    record_key,
                    field,
                    field_type,
                    value,
                    slot,
                } => match (field_type, value) {
                    (_, FieldValue::Null) => place(&mut nodes, &slot, Value::Null),
                    (FieldType::Scalar | FieldType::CustomScalar(_), value) => {
                        let json = scalar_json(&value).ok_or_else(|| {
                            self.miss(format!(
                                "reference stored in scalar field {}.{}",
                                record_key, field.response_name
                            ))
                        })?;
                        place(&mut nodes, &slot, json);
                    }
                    (FieldType::Object(selections), FieldValue::Reference(reference)) => {
                        let record = self.load(reference.key())?;
                        dependent_keys.insert(reference.key().to_string());
                        nodes.push((Value::Object(Map::new()), Some(slot)));
                        tasks.push(Task::Object {
                            record,
                            selections,
                            node: nodes.len() - 1,
                        });
                    }
                    (FieldType::List(item_type), FieldValue::List(items)) => {
                        nodes.push((Value::Array(vec![Value::Null; items.len()]), Some(slot)));
                        let node = nodes.len() - 1;
                        for (index, item) in items.into_iter().enumerate() {
                            tasks.push(Task::Value {
                                record_key: record_key.clone(),
                                field,
                                field_type: item_type.as_ref(),
                                value: item,
                                slot: Slot::Element(node, index),
                            });
                        }
                    }
                    (_, other) => {
                        return Err(self.miss(format!(
                            "unexpected value for {}.{}: {:?}",
                            record_key, field.response_name, other
                        )));
                    }
                },
            }
        }

        // Children always sit after their parents in the arena.
        for index in (1..nodes.len()).rev() {
            let (value, slot) = std::mem::replace(&mut nodes[index], (Value::Null, None));
            if let Some(slot) = slot {
                place(&mut nodes, &slot, value);
            }
        }
        let data = nodes.swap_remove(0).0;

        Ok(CacheRead {
            data,
            dependent_keys,
        })
    }

    fn field_value(
        &self,
        record: &Record,
        field: &ResponseField,
        variables: &Variables,
        dependent_keys: &mut HashSet<String>,
    ) -> StrataResult<FieldValue> {
        if matches!(field.field_type, FieldType::Object(_)) {
            if let CacheKey::Key(key) = resolve_argument_key(self.resolver, field, variables) {
                return Ok(FieldValue::reference(key));
            }
        }
        let field_key = self.key_builder.build(field, variables);
        dependent_keys.insert(field_path(record.key(), &field_key));
        record
            .field(&field_key)
            .cloned()
            .ok_or_else(|| self.miss(format!("missing value: {}.{}", record.key(), field_key)))
    }
}

fn place(nodes: &mut [(Value, Option<Slot>)], slot: &Slot, value: Value) {
    match slot {
        Slot::Field(parent, name) => {
            if let Value::Object(map) = &mut nodes[*parent].0 {
                map.insert(name.clone(), value);
            }
        }
        Slot::Element(parent, index) => {
            if let Value::Array(items) = &mut nodes[*parent].0 {
                if let Some(item) = items.get_mut(*index) {
                    *item = value;
                }
            }
        }
    }
}

/// Scalar trees only; `None` if a reference is found.
fn scalar_json(value: &FieldValue) -> Option<Value> {
    match value {
        FieldValue::Null => Some(Value::Null),
        FieldValue::Scalar(v) => Some(v.clone()),
        FieldValue::Reference(_) => None,
        FieldValue::List(items) => items.iter().map(scalar_json).collect::<Option<Vec<_>>>().map(Value::Array),
    }
}
