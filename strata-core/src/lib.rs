//! STRATA Core - Records, Keys and Normalization
//!
//! Data model of the normalized store and the algorithm that fills it.
//! No I/O and no async: storage backends live in `strata-storage`, the
//! interceptor pipeline in `strata-runtime`.

pub mod config;
pub mod error;
pub mod headers;
pub mod key;
pub mod normalizer;
pub mod operation;
pub mod policy;
pub mod record;
pub mod response;
pub mod walker;

pub use config::{EvictionConfig, StrataConfig};
pub use error::{ConfigError, StorageError, StrataError, StrataResult};
pub use headers::{CacheHeaders, CacheHeadersBuilder};
pub use key::{
    resolve_argument_key, resolve_arguments, resolve_object_key, CacheKey, CacheKeyBuilder,
    CacheKeyResolver, DefaultCacheKeyBuilder, NoKeyResolver, ResolverError,
};
pub use normalizer::{Normalized, ResponseNormalizer};
pub use operation::{
    collect_fields, minify_document, operation_id_for, variable_reference, Condition, FieldType,
    Operation, OperationDescriptor, OperationKind, ResponseField, Variables, MUTATION_ROOT_KEY,
    QUERY_ROOT_KEY, SUBSCRIPTION_ROOT_KEY,
};
pub use policy::{FetchPolicy, FetchPolicyParseError, SubscriptionFetchPolicy};
pub use record::{field_path, CacheReference, FieldValue, Record, RecordBuilder, RecordSet};
pub use response::{ErrorLocation, FetchSource, GraphQlError, Response};
pub use walker::{ResolveEvent, ResponseWalker};
