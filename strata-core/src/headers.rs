//! Per-request cache directives.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String headers flowing with a request into every store call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheHeaders {
    headers: BTreeMap<String, String>,
}

impl CacheHeaders {
    /// Do not write this request's response into the store.
    pub const DO_NOT_STORE: &'static str = "do-not-store";
    /// Remove every record read for this request once it has been read.
    pub const EVICT_AFTER_READ: &'static str = "evict-after-read";
    /// Merge responses even when they carry errors.
    pub const STORE_PARTIAL_RESPONSES: &'static str = "store-partial-responses";

    pub fn none() -> Self {
        Self::default()
    }

    pub fn builder() -> CacheHeadersBuilder {
        CacheHeadersBuilder::default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// A header set to anything but `"false"` counts as enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.header(name).map(|v| v != "false").unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn do_not_store(&self) -> bool {
        self.is_enabled(Self::DO_NOT_STORE)
    }

    pub fn evict_after_read(&self) -> bool {
        self.is_enabled(Self::EVICT_AFTER_READ)
    }

    pub fn store_partial_responses(&self) -> bool {
        self.is_enabled(Self::STORE_PARTIAL_RESPONSES)
    }

    pub fn to_builder(&self) -> CacheHeadersBuilder {
        CacheHeadersBuilder {
            headers: self.headers.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheHeadersBuilder {
    headers: BTreeMap<String, String>,
}

impl CacheHeadersBuilder {
    pub fn add(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn enable(self, name: &str) -> Self {
        self.add(name, "true")
    }

    pub fn build(self) -> CacheHeaders {
        CacheHeaders {
            headers: self.headers,
        }
    }
}
