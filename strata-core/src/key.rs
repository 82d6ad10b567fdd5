//! Cache keys for fields and objects.
//!
//! Two concerns live here:
//! - [`CacheKeyBuilder`] names the slot a field occupies inside its record,
//!   combining the schema field name with canonicalized arguments.
//! - [`CacheKeyResolver`] decides whether an object gets a global identity
//!   (its own top-level record) or is stored at its response path.

use crate::operation::{ResponseField, Variables};
use serde_json::{Map, Value};
use thiserror::Error;

/// Identity of an object in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Stored at its response path, reachable only through that path.
    NoKey,
    /// Independently addressable record.
    Key(String),
}

impl CacheKey {
    pub fn from(key: impl Into<String>) -> Self {
        CacheKey::Key(key.into())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, CacheKey::NoKey)
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            CacheKey::NoKey => None,
            CacheKey::Key(key) => Some(key),
        }
    }
}

/// Raised by a resolver that cannot decide. Always treated as [`CacheKey::NoKey`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cache key resolution failed: {reason}")]
pub struct ResolverError {
    pub reason: String,
}

impl ResolverError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Pluggable identity strategy.
pub trait CacheKeyResolver: Send + Sync {
    /// Identity of a fully resolved response object.
    fn from_object(
        &self,
        field: &ResponseField,
        object: &Map<String, Value>,
    ) -> Result<CacheKey, ResolverError>;

    /// Identity implied by a field's arguments alone, letting reads jump
    /// straight to a record (for example `hero(id: "2001")` → `2001`).
    fn from_arguments(
        &self,
        _field: &ResponseField,
        _variables: &Variables,
    ) -> Result<CacheKey, ResolverError> {
        Ok(CacheKey::NoKey)
    }
}

/// Never assigns identities; every object is stored at its path.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeyResolver;

impl CacheKeyResolver for NoKeyResolver {
    fn from_object(
        &self,
        _field: &ResponseField,
        _object: &Map<String, Value>,
    ) -> Result<CacheKey, ResolverError> {
        Ok(CacheKey::NoKey)
    }
}

/// Resolve an object key, treating resolver failure as `NoKey`.
pub fn resolve_object_key(
    resolver: &dyn CacheKeyResolver,
    field: &ResponseField,
    object: &Map<String, Value>,
) -> CacheKey {
    match resolver.from_object(field, object) {
        Ok(key) => key,
        Err(e) => {
            tracing::debug!(field = %field.field_name, error = %e, "resolver failed, storing object at path");
            CacheKey::NoKey
        }
    }
}

/// Resolve a redirect key from arguments, treating resolver failure as `NoKey`.
pub fn resolve_argument_key(
    resolver: &dyn CacheKeyResolver,
    field: &ResponseField,
    variables: &Variables,
) -> CacheKey {
    match resolver.from_arguments(field, variables) {
        Ok(key) => key,
        Err(e) => {
            tracing::debug!(field = %field.field_name, error = %e, "resolver failed for arguments");
            CacheKey::NoKey
        }
    }
}

/// Names the slot a field occupies inside its parent record.
pub trait CacheKeyBuilder: Send + Sync {
    fn build(&self, field: &ResponseField, variables: &Variables) -> String;
}

/// `fieldName` without arguments, `fieldName(<canonical JSON>)` with them.
///
/// Arguments have variable references substituted and object keys sorted at
/// every depth, so the key does not depend on declaration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCacheKeyBuilder;

impl CacheKeyBuilder for DefaultCacheKeyBuilder {
    fn build(&self, field: &ResponseField, variables: &Variables) -> String {
        if field.arguments.is_empty() {
            return field.field_name.clone();
        }
        let resolved = resolve_arguments(&field.arguments, variables);
        format!("{}({})", field.field_name, resolved)
    }
}

/// Substitute variables and sort object keys recursively.
pub fn resolve_arguments(arguments: &Map<String, Value>, variables: &Variables) -> Value {
    canonicalize(&Value::Object(arguments.clone()), variables)
}

fn canonicalize(value: &Value, variables: &Variables) -> Value {
    match value {
        Value::Object(map) => {
            if let Some(name) = variable_name(map) {
                let bound = variables.get(name).cloned().unwrap_or(Value::Null);
                return canonicalize(&bound, &Variables::new());
            }
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()], variables));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| canonicalize(v, variables)).collect()),
        other => other.clone(),
    }
}

fn variable_name(map: &Map<String, Value>) -> Option<&str> {
    if map.len() != 2 || map.get("kind").and_then(Value::as_str) != Some("Variable") {
        return None;
    }
    map.get("variableName").and_then(Value::as_str)
}
