//! Fetch policies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How cache and network sources combine for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchPolicy {
    /// Cache only; a miss is a failure.
    CacheOnly,
    /// Network only.
    NetworkOnly,
    /// Cache, falling back to the network on any cache failure.
    #[default]
    CacheFirst,
    /// Network, falling back to the cache on network failure.
    NetworkFirst,
    /// Both at once; the cache outcome is always delivered first.
    CacheAndNetwork,
}

impl FetchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchPolicy::CacheOnly => "cache_only",
            FetchPolicy::NetworkOnly => "network_only",
            FetchPolicy::CacheFirst => "cache_first",
            FetchPolicy::NetworkFirst => "network_first",
            FetchPolicy::CacheAndNetwork => "cache_and_network",
        }
    }

    /// Whether this policy may deliver more than one response.
    pub fn is_multi_response(&self) -> bool {
        matches!(self, FetchPolicy::CacheAndNetwork)
    }
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error when parsing an invalid fetch policy string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicyParseError(pub String);

impl fmt::Display for FetchPolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid fetch policy: {}", self.0)
    }
}

impl std::error::Error for FetchPolicyParseError {}

impl FromStr for FetchPolicy {
    type Err = FetchPolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "cache_only" => Ok(FetchPolicy::CacheOnly),
            "network_only" => Ok(FetchPolicy::NetworkOnly),
            "cache_first" => Ok(FetchPolicy::CacheFirst),
            "network_first" => Ok(FetchPolicy::NetworkFirst),
            "cache_and_network" => Ok(FetchPolicy::CacheAndNetwork),
            _ => Err(FetchPolicyParseError(s.to_string())),
        }
    }
}

/// How a subscription's payloads interact with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionFetchPolicy {
    /// Deliver payloads without touching the store.
    NoCache,
    /// Write and publish every payload.
    #[default]
    NetworkOnly,
    /// Deliver the cached value first, then behave like `NetworkOnly`.
    CacheAndNetwork,
}

impl SubscriptionFetchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionFetchPolicy::NoCache => "no_cache",
            SubscriptionFetchPolicy::NetworkOnly => "network_only",
            SubscriptionFetchPolicy::CacheAndNetwork => "cache_and_network",
        }
    }

    pub fn writes_to_store(&self) -> bool {
        !matches!(self, SubscriptionFetchPolicy::NoCache)
    }

    pub fn reads_from_store(&self) -> bool {
        matches!(self, SubscriptionFetchPolicy::CacheAndNetwork)
    }
}

impl fmt::Display for SubscriptionFetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionFetchPolicy {
    type Err = FetchPolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "no_cache" => Ok(SubscriptionFetchPolicy::NoCache),
            "network_only" => Ok(SubscriptionFetchPolicy::NetworkOnly),
            "cache_and_network" => Ok(SubscriptionFetchPolicy::CacheAndNetwork),
            _ => Err(FetchPolicyParseError(s.to_string())),
        }
    }
}
