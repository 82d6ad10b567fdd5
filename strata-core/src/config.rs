//! Client configuration.
//!
//! Loaded from `STRATA_*` environment variables or a TOML document, with
//! defaults suitable for an in-memory cache that never evicts.

use crate::error::{ConfigError, StrataError, StrataResult};
use crate::headers::CacheHeaders;
use crate::policy::FetchPolicy;
use serde::{Deserialize, Serialize};

// ============================================================================
// EVICTION
// ============================================================================

/// Bounds for the in-memory record cache. `None` disables a bound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub max_entries: Option<usize>,
    pub max_size_bytes: Option<u64>,
    pub expire_after_write_secs: Option<u64>,
    pub expire_after_access_secs: Option<u64>,
}

impl EvictionConfig {
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn with_max_size_bytes(mut self, max_size_bytes: u64) -> Self {
        self.max_size_bytes = Some(max_size_bytes);
        self
    }

    pub fn with_expire_after_write(mut self, secs: u64) -> Self {
        self.expire_after_write_secs = Some(secs);
        self
    }

    pub fn with_expire_after_access(mut self, secs: u64) -> Self {
        self.expire_after_access_secs = Some(secs);
        self
    }

    pub fn expire_after_write(&self) -> Option<chrono::Duration> {
        self.expire_after_write_secs.map(secs_to_duration)
    }

    pub fn expire_after_access(&self) -> Option<chrono::Duration> {
        self.expire_after_access_secs.map(secs_to_duration)
    }
}

fn secs_to_duration(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
}

// ============================================================================
// CLIENT CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Policy for calls that do not set one.
    pub default_fetch_policy: FetchPolicy,
    /// Policy a watcher uses when it refetches after invalidation.
    pub refetch_policy: FetchPolicy,
    /// `false` selects the stateless no-op store.
    pub store_enabled: bool,
    pub eviction: EvictionConfig,
    /// Merge network responses off the response path.
    pub write_to_cache_asynchronously: bool,
    /// Send the full document, not only the persisted query hash.
    pub send_query_document: bool,
    pub default_cache_headers: CacheHeaders,
    /// `tracing-subscriber` filter directive.
    pub log_filter: String,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            default_fetch_policy: FetchPolicy::CacheFirst,
            refetch_policy: FetchPolicy::CacheFirst,
            store_enabled: true,
            eviction: EvictionConfig::default(),
            write_to_cache_asynchronously: false,
            send_query_document: true,
            default_cache_headers: CacheHeaders::none(),
            log_filter: "info".to_string(),
        }
    }
}

impl StrataConfig {
    /// Create a configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STRATA_DEFAULT_FETCH_POLICY`: e.g. `cache_first` (default)
    /// - `STRATA_REFETCH_POLICY`: watcher refetch policy (default: `cache_first`)
    /// - `STRATA_STORE_ENABLED`: "false" disables the normalized store
    /// - `STRATA_CACHE_MAX_ENTRIES`, `STRATA_CACHE_MAX_BYTES`
    /// - `STRATA_CACHE_EXPIRE_AFTER_WRITE_SECS`, `STRATA_CACHE_EXPIRE_AFTER_ACCESS_SECS`
    /// - `STRATA_WRITE_TO_CACHE_ASYNC`: "true" or "false" (default: false)
    /// - `STRATA_SEND_QUERY_DOCUMENT`: "true" or "false" (default: true)
    /// - `STRATA_LOG`: log filter (default: info)
    ///
    /// Values that fail to parse fall back to their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let default_fetch_policy = std::env::var("STRATA_DEFAULT_FETCH_POLICY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.default_fetch_policy);

        let refetch_policy = std::env::var("STRATA_REFETCH_POLICY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.refetch_policy);

        let store_enabled = std::env::var("STRATA_STORE_ENABLED")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        let eviction = EvictionConfig {
            max_entries: env_parse("STRATA_CACHE_MAX_ENTRIES"),
            max_size_bytes: env_parse("STRATA_CACHE_MAX_BYTES"),
            expire_after_write_secs: env_parse("STRATA_CACHE_EXPIRE_AFTER_WRITE_SECS"),
            expire_after_access_secs: env_parse("STRATA_CACHE_EXPIRE_AFTER_ACCESS_SECS"),
        };

        let write_to_cache_asynchronously = std::env::var("STRATA_WRITE_TO_CACHE_ASYNC")
            .ok()
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(false);

        let send_query_document = std::env::var("STRATA_SEND_QUERY_DOCUMENT")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        let log_filter = std::env::var("STRATA_LOG").unwrap_or(defaults.log_filter);

        Self {
            default_fetch_policy,
            refetch_policy,
            store_enabled,
            eviction,
            write_to_cache_asynchronously,
            send_query_document,
            default_cache_headers: CacheHeaders::none(),
            log_filter,
        }
    }

    /// Parse and validate a TOML document. Missing keys take defaults.
    pub fn from_toml_str(source: &str) -> StrataResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StrataResult<()> {
        if self.eviction.max_entries == Some(0) {
            return Err(invalid("eviction.max_entries", "0", "max_entries must be greater than 0"));
        }
        if self.eviction.max_size_bytes == Some(0) {
            return Err(invalid(
                "eviction.max_size_bytes",
                "0",
                "max_size_bytes must be greater than 0",
            ));
        }
        if self.eviction.expire_after_write_secs == Some(0) {
            return Err(invalid(
                "eviction.expire_after_write_secs",
                "0",
                "expiry must be at least one second",
            ));
        }
        if self.eviction.expire_after_access_secs == Some(0) {
            return Err(invalid(
                "eviction.expire_after_access_secs",
                "0",
                "expiry must be at least one second",
            ));
        }
        if self.log_filter.trim().is_empty() {
            return Err(invalid("log_filter", "", "log_filter must not be empty"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn invalid(field: &str, value: &str, reason: &str) -> StrataError {
    StrataError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StrataConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.store_enabled);
        assert_eq!(config.refetch_policy, FetchPolicy::CacheFirst);
    }

    #[test]
    fn test_from_toml_partial_document() {
        let config = StrataConfig::from_toml_str(
            r#"
            default_fetch_policy = "cache_and_network"
            store_enabled = false

            [eviction]
            max_entries = 500
            expire_after_write_secs = 60

            [default_cache_headers]
            do-not-store = "true"
            "#,
        )
        .unwrap();

        assert_eq!(config.default_fetch_policy, FetchPolicy::CacheAndNetwork);
        assert!(!config.store_enabled);
        assert_eq!(config.eviction.max_entries, Some(500));
        assert_eq!(
            config.eviction.expire_after_write(),
            Some(chrono::Duration::seconds(60))
        );
        assert!(config.default_cache_headers.do_not_store());
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_from_toml_rejects_zero_bound() {
        let err = StrataConfig::from_toml_str("[eviction]\nmax_entries = 0\n").unwrap_err();
        assert!(matches!(err, StrataError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        let err = StrataConfig::from_toml_str("default_fetch_policy = 12").unwrap_err();
        assert!(matches!(err, StrataError::Config(ConfigError::ParseFailed { .. })));
    }

    #[test]
    fn test_from_env_reads_fetch_policy() {
        std::env::set_var("STRATA_DEFAULT_FETCH_POLICY", "network_first");
        let config = StrataConfig::from_env();
        std::env::remove_var("STRATA_DEFAULT_FETCH_POLICY");
        assert_eq!(config.default_fetch_policy, FetchPolicy::NetworkFirst);
    }
}
