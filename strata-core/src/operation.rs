//! Operation descriptors and selection sets.
//!
//! Operations are produced by code generation outside this workspace. The
//! engine only needs the pieces described here: a name, a kind, resolved
//! variables and the selection tree used to walk responses and records.

use crate::error::{StrataError, StrataResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Resolved variable bindings of an operation.
pub type Variables = Map<String, Value>;

/// Root record key for queries.
pub const QUERY_ROOT_KEY: &str = "QUERY_ROOT";
/// Root record key for mutations.
pub const MUTATION_ROOT_KEY: &str = "MUTATION_ROOT";
/// Root record key for subscriptions.
pub const SUBSCRIPTION_ROOT_KEY: &str = "SUBSCRIPTION_ROOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    /// Stable sentinel key of the root record for this kind.
    pub fn root_key(&self) -> &'static str {
        match self {
            OperationKind::Query => QUERY_ROOT_KEY,
            OperationKind::Mutation => MUTATION_ROOT_KEY,
            OperationKind::Subscription => SUBSCRIPTION_ROOT_KEY,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `@include(if: $var)` / `@skip(if: $var)` on a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Include(String),
    Skip(String),
}

impl Condition {
    /// A variable that is missing or not a boolean counts as `false`.
    pub fn passes(&self, variables: &Variables) -> bool {
        match self {
            Condition::Include(name) => flag(variables, name),
            Condition::Skip(name) => !flag(variables, name),
        }
    }
}

fn flag(variables: &Variables, name: &str) -> bool {
    variables.get(name).and_then(Value::as_bool).unwrap_or(false)
}

/// Shape of a selected field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Scalar,
    /// Custom scalar carried as raw JSON; decoding is left to the typed data.
    CustomScalar(String),
    Object(Vec<ResponseField>),
    List(Box<FieldType>),
    /// Inline fragment, selected when the enclosing object's `__typename`
    /// matches one of the type conditions (or there are none).
    Fragment {
        type_conditions: Vec<String>,
        selections: Vec<ResponseField>,
    },
}

/// One selected field of a selection set.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseField {
    pub field_type: FieldType,
    /// Name in the response, the alias when one is present.
    pub response_name: String,
    /// Name in the schema; the only name that affects cache keys.
    pub field_name: String,
    /// Argument object, possibly holding variable references.
    pub arguments: Map<String, Value>,
    pub optional: bool,
    pub conditions: Vec<Condition>,
}

impl ResponseField {
    fn with_type(field_type: FieldType, name: &str) -> Self {
        Self {
            field_type,
            response_name: name.to_string(),
            field_name: name.to_string(),
            arguments: Map::new(),
            optional: true,
            conditions: Vec::new(),
        }
    }

    pub fn scalar(name: &str) -> Self {
        Self::with_type(FieldType::Scalar, name)
    }

    pub fn custom_scalar(name: &str, scalar_type: &str) -> Self {
        Self::with_type(FieldType::CustomScalar(scalar_type.to_string()), name)
    }

    pub fn object(name: &str, selections: Vec<ResponseField>) -> Self {
        Self::with_type(FieldType::Object(selections), name)
    }

    pub fn list(name: &str, item_type: FieldType) -> Self {
        Self::with_type(FieldType::List(Box::new(item_type)), name)
    }

    /// List of objects, the common case.
    pub fn object_list(name: &str, selections: Vec<ResponseField>) -> Self {
        Self::list(name, FieldType::Object(selections))
    }

    pub fn fragment(type_conditions: &[&str], selections: Vec<ResponseField>) -> Self {
        Self::with_type(
            FieldType::Fragment {
                type_conditions: type_conditions.iter().map(|s| s.to_string()).collect(),
                selections,
            },
            "",
        )
    }

    pub fn alias(mut self, response_name: &str) -> Self {
        self.response_name = response_name.to_string();
        self
    }

    /// Set the argument object. Anything but a JSON object is ignored.
    pub fn arguments(mut self, arguments: Value) -> Self {
        if let Value::Object(map) = arguments {
            self.arguments = map;
        }
        self
    }

    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }

    pub fn include_if(mut self, variable: &str) -> Self {
        self.conditions.push(Condition::Include(variable.to_string()));
        self
    }

    pub fn skip_if(mut self, variable: &str) -> Self {
        self.conditions.push(Condition::Skip(variable.to_string()));
        self
    }

    pub fn is_fragment(&self) -> bool {
        matches!(self.field_type, FieldType::Fragment { .. })
    }

    pub fn is_included(&self, variables: &Variables) -> bool {
        self.conditions.iter().all(|c| c.passes(variables))
    }
}

/// Reference to a variable inside an argument object.
pub fn variable_reference(name: &str) -> Value {
    serde_json::json!({ "kind": "Variable", "variableName": name })
}

/// Collect the fields selected on an object with the given typename,
/// flattening matching inline fragments in document order.
pub fn collect_fields<'a>(
    selections: &'a [ResponseField],
    typename: Option<&str>,
    variables: &Variables,
) -> Vec<&'a ResponseField> {
    let mut out = Vec::new();
    let mut pending: Vec<&'a ResponseField> = selections.iter().rev().collect();
    while let Some(field) = pending.pop() {
        if !field.is_included(variables) {
            continue;
        }
        match &field.field_type {
            FieldType::Fragment {
                type_conditions,
                selections,
            } => {
                let matches = type_conditions.is_empty()
                    || typename
                        .map(|t| type_conditions.iter().any(|c| c == t))
                        .unwrap_or(false);
                if matches {
                    pending.extend(selections.iter().rev());
                }
            }
            _ => out.push(field),
        }
    }
    out
}

/// Object-safe view of an operation, used throughout the interceptor chain.
pub trait OperationDescriptor: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn kind(&self) -> OperationKind;

    /// Query document text.
    fn document(&self) -> &str;

    fn variables(&self) -> Variables;

    fn selections(&self) -> &[ResponseField];

    /// Stable id of the document, used for persisted queries.
    fn operation_id(&self) -> String {
        operation_id_for(self.document())
    }

    fn root_key(&self) -> &'static str {
        self.kind().root_key()
    }
}

/// A typed operation whose response data decodes into `Data`.
pub trait Operation: OperationDescriptor + 'static {
    type Data: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn parse_data(&self, value: Value) -> StrataResult<Self::Data> {
        serde_json::from_value(value).map_err(|e| {
            StrataError::parse(format!("failed to decode data for {}: {}", self.name(), e))
        })
    }
}

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Collapse runs of whitespace so formatting does not change the operation id.
pub fn minify_document(document: &str) -> String {
    WHITESPACE.replace_all(document.trim(), " ").into_owned()
}

/// Lowercase hex SHA-256 of the minified document.
pub fn operation_id_for(document: &str) -> String {
    let digest = Sha256::digest(minify_document(document).as_bytes());
    hex::encode(digest)
}
