//! Response types delivered to callers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    Cache,
    Network,
}

impl fmt::Display for FetchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchSource::Cache => f.write_str("cache"),
            FetchSource::Network => f.write_str("network"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLocation {
    pub line: u64,
    pub column: u64,
}

/// An entry of the `errors` array of a server response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<ErrorLocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: Vec::new(),
            extensions: None,
        }
    }
}

/// A typed response for one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<D> {
    pub operation_name: String,
    pub data: Option<D>,
    pub errors: Vec<GraphQlError>,
    /// Record and field keys this response was built from.
    pub dependent_keys: HashSet<String>,
    pub source: FetchSource,
    pub extensions: Map<String, Value>,
}

impl<D> Response<D> {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_from_cache(&self) -> bool {
        self.source == FetchSource::Cache
    }

    pub fn map_data<T>(self, f: impl FnOnce(D) -> T) -> Response<T> {
        Response {
            operation_name: self.operation_name,
            data: self.data.map(f),
            errors: self.errors,
            dependent_keys: self.dependent_keys,
            source: self.source,
            extensions: self.extensions,
        }
    }
}
