//! Records, field values and the merge algebra of the normalized store.
//!
//! A [`Record`] is a flat bag of fields. Nested objects never appear inline:
//! they are stored as their own records and referenced through a
//! [`CacheReference`], so the store stays graph-shaped without duplication.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Pointer-by-key from one record's field to another record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheReference {
    key: String,
}

impl CacheReference {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CacheReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheReference({})", self.key)
    }
}

/// A single field value inside a record.
///
/// `Null` is an explicit null and is distinct from an absent field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Explicit null
    Null,
    /// Any non-null JSON leaf, including raw custom scalar payloads
    Scalar(serde_json::Value),
    /// Reference to another record
    Reference(CacheReference),
    /// Ordered sequence of values
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Build a scalar value, mapping JSON null to [`FieldValue::Null`].
    pub fn from_scalar_json(value: serde_json::Value) -> Self {
        if value.is_null() {
            FieldValue::Null
        } else {
            FieldValue::Scalar(value)
        }
    }

    pub fn reference(key: impl Into<String>) -> Self {
        FieldValue::Reference(CacheReference::new(key))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_reference(&self) -> Option<&CacheReference> {
        match self {
            FieldValue::Reference(reference) => Some(reference),
            _ => None,
        }
    }

    /// All references held by this value, including those nested in lists.
    pub fn references(&self) -> Vec<&CacheReference> {
        let mut found = Vec::new();
        let mut pending = vec![self];
        while let Some(value) = pending.pop() {
            match value {
                FieldValue::Reference(reference) => found.push(reference),
                FieldValue::List(items) => pending.extend(items.iter().rev()),
                FieldValue::Null | FieldValue::Scalar(_) => {}
            }
        }
        found
    }

    /// Rough in-memory footprint, used by size-bounded eviction.
    pub fn size_estimate(&self) -> usize {
        match self {
            FieldValue::Null => 1,
            FieldValue::Scalar(value) => match value {
                serde_json::Value::String(s) => s.len(),
                serde_json::Value::Bool(_) => 1,
                serde_json::Value::Number(_) => 8,
                other => other.to_string().len(),
            },
            FieldValue::Reference(reference) => reference.key.len(),
            FieldValue::List(items) => items.iter().map(FieldValue::size_estimate).sum::<usize>() + 8,
        }
    }
}

impl From<CacheReference> for FieldValue {
    fn from(reference: CacheReference) -> Self {
        FieldValue::Reference(reference)
    }
}

/// Flat, key-addressed bag of fields representing one normalized entity or path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    key: String,
    fields: BTreeMap<String, FieldValue>,
    /// Set while the record carries fields from an unconfirmed optimistic patch.
    mutation_id: Option<Uuid>,
}

impl Record {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
            mutation_id: None,
        }
    }

    pub fn builder(key: impl Into<String>) -> RecordBuilder {
        RecordBuilder::new(key)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn field(&self, field_key: &str) -> Option<&FieldValue> {
        self.fields.get(field_key)
    }

    /// True for explicit nulls as well as values.
    pub fn has_field(&self, field_key: &str) -> bool {
        self.fields.contains_key(field_key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn mutation_id(&self) -> Option<Uuid> {
        self.mutation_id
    }

    pub fn with_mutation_id(mut self, mutation_id: Option<Uuid>) -> Self {
        self.mutation_id = mutation_id;
        self
    }

    pub fn set_field(&mut self, field_key: impl Into<String>, value: FieldValue) {
        self.fields.insert(field_key.into(), value);
    }

    pub fn remove_field(&mut self, field_key: &str) -> Option<FieldValue> {
        self.fields.remove(field_key)
    }

    /// Dependent keys of every field, as `recordKey.fieldKey`.
    pub fn field_keys(&self) -> BTreeSet<String> {
        self.fields
            .keys()
            .map(|field_key| field_path(&self.key, field_key))
            .collect()
    }

    /// Every reference held directly by this record's fields.
    pub fn references(&self) -> Vec<CacheReference> {
        self.fields
            .values()
            .flat_map(|value| value.references().into_iter().cloned())
            .collect()
    }

    /// Merge `other` into this record field by field.
    ///
    /// Incoming values overwrite differing ones, absent fields are preserved.
    /// Returns the `recordKey.fieldKey` of every field whose value changed.
    pub fn merge_from(&mut self, other: &Record) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        for (field_key, value) in &other.fields {
            let differs = self.fields.get(field_key) != Some(value);
            if differs {
                self.fields.insert(field_key.clone(), value.clone());
                changed.insert(field_path(&self.key, field_key));
            }
        }
        self.mutation_id = other.mutation_id;
        changed
    }

    pub fn size_estimate(&self) -> usize {
        self.key.len()
            + self
                .fields
                .iter()
                .map(|(k, v)| k.len() + v.size_estimate())
                .sum::<usize>()
    }

    pub fn to_builder(&self) -> RecordBuilder {
        RecordBuilder {
            key: self.key.clone(),
            fields: self.fields.clone(),
            mutation_id: self.mutation_id,
        }
    }
}

/// `recordKey.fieldKey` as used for dependent and changed keys.
pub fn field_path(record_key: &str, field_key: &str) -> String {
    format!("{record_key}.{field_key}")
}

/// Mutable record under construction.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    key: String,
    fields: BTreeMap<String, FieldValue>,
    mutation_id: Option<Uuid>,
}

impl RecordBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
            mutation_id: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn add_field(&mut self, field_key: impl Into<String>, value: FieldValue) {
        self.fields.insert(field_key.into(), value);
    }

    pub fn field(mut self, field_key: impl Into<String>, value: FieldValue) -> Self {
        self.add_field(field_key, value);
        self
    }

    pub fn scalar(self, field_key: impl Into<String>, value: serde_json::Value) -> Self {
        self.field(field_key, FieldValue::from_scalar_json(value))
    }

    pub fn mutation_id(mut self, mutation_id: Option<Uuid>) -> Self {
        self.mutation_id = mutation_id;
        self
    }

    pub fn build(self) -> Record {
        Record {
            key: self.key,
            fields: self.fields,
            mutation_id: self.mutation_id,
        }
    }
}

/// Working set of records produced by one normalization pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    records: HashMap<String, Record>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a record into the set, returning the changed field keys.
    pub fn merge(&mut self, record: Record) -> BTreeSet<String> {
        match self.records.get_mut(record.key()) {
            Some(existing) => existing.merge_from(&record),
            None => {
                let changed = record.field_keys();
                self.records.insert(record.key.clone(), record);
                changed
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> HashSet<String> {
        self.records.keys().cloned().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records.into_values().collect()
    }

    /// Tag every record with the given mutation id.
    pub fn tag(&mut self, mutation_id: Option<Uuid>) {
        for record in self.records.values_mut() {
            record.mutation_id = mutation_id;
        }
    }
}

impl FromIterator<Record> for RecordSet {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        let mut set = RecordSet::new();
        for record in iter {
            set.merge(record);
        }
        set
    }
}

// =============================================================================
// TESTS
// =============================================================================
