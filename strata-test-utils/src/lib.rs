//! STRATA Test Utilities
//!
//! Centralized test infrastructure for the STRATA workspace:
//! - Scripted mock network and subscription transports
//! - Fixture operations modeled on a small hero/friends schema
//! - Proptest generators for records and response trees
//! - Custom assertions for STRATA-specific errors

pub use strata_core::{
    CacheHeaders, CacheKey, CacheKeyResolver, FetchPolicy, FetchSource, Operation,
    OperationDescriptor, OperationKind, Record, RecordSet, ResolverError, Response, ResponseField,
    StrataConfig, StrataError, StrataResult, Variables,
};
pub use strata_runtime::{
    NetworkTransport, PayloadStream, SubscriptionTransport, TransportError, TransportRequest,
};

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

struct Scripted {
    result: Result<Vec<u8>, TransportError>,
    delay: Option<Duration>,
    gate: Option<oneshot::Receiver<()>>,
}

/// Releases a gated response when opened or dropped.
#[derive(Debug)]
pub struct Gate(oneshot::Sender<()>);

impl Gate {
    pub fn open(self) {
        let _ = self.0.send(());
    }
}

/// Transport that replays scripted responses in order and records every
/// request it receives.
#[derive(Default)]
pub struct MockTransport {
    scripted: Mutex<VecDeque<Scripted>>,
    fallback: Mutex<Option<Result<Vec<u8>, TransportError>>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("requests", &self.request_count())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, scripted: Scripted) {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(scripted);
    }

    /// Queue a response body.
    pub fn push_json(&self, body: Value) {
        self.push(Scripted {
            result: Ok(body.to_string().into_bytes()),
            delay: None,
            gate: None,
        });
    }

    /// Queue a response body delivered after `delay`.
    pub fn push_delayed_json(&self, body: Value, delay: Duration) {
        self.push(Scripted {
            result: Ok(body.to_string().into_bytes()),
            delay: Some(delay),
            gate: None,
        });
    }

    /// Queue a response body held back until the returned gate opens.
    pub fn push_gated_json(&self, body: Value) -> Gate {
        let (tx, rx) = oneshot::channel();
        self.push(Scripted {
            result: Ok(body.to_string().into_bytes()),
            delay: None,
            gate: Some(rx),
        });
        Gate(tx)
    }

    /// Queue a failure held back until the returned gate opens.
    pub fn push_gated_error(&self, error: TransportError) -> Gate {
        let (tx, rx) = oneshot::channel();
        self.push(Scripted {
            result: Err(error),
            delay: None,
            gate: Some(rx),
        });
        Gate(tx)
    }

    pub fn push_raw(&self, body: &[u8]) {
        self.push(Scripted {
            result: Ok(body.to_vec()),
            delay: None,
            gate: None,
        });
    }

    pub fn push_error(&self, error: TransportError) {
        self.push(Scripted {
            result: Err(error),
            delay: None,
            gate: None,
        });
    }

    /// Response used once the script runs out.
    pub fn always_json(&self, body: Value) {
        *self.fallback.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Ok(body.to_string().into_bytes()));
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Request bodies decoded as JSON.
    pub fn request_bodies(&self) -> Vec<Value> {
        self.requests()
            .iter()
            .filter_map(|r| serde_json::from_slice(&r.body).ok())
            .collect()
    }

    /// Names of the operations sent, in order.
    pub fn operation_names(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| r.operation_name)
            .collect()
    }
}

#[async_trait]
impl NetworkTransport for MockTransport {
    async fn execute(&self, request: TransportRequest) -> Result<Vec<u8>, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let next = self
            .scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(scripted) = next else {
            return self
                .fallback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or_else(|| {
                    Err(TransportError::Io {
                        reason: "no scripted response".to_string(),
                    })
                });
        };
        if let Some(gate) = scripted.gate {
            let _ = gate.await;
        }
        if let Some(delay) = scripted.delay {
            tokio::time::sleep(delay).await;
        }
        scripted.result
    }
}

// ============================================================================
// MOCK SUBSCRIPTION TRANSPORT
// ============================================================================

/// Pushes payloads into an open subscription. Dropping it ends the stream.
#[derive(Debug, Clone)]
pub struct PayloadSender(mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>);

impl PayloadSender {
    pub fn send_json(&self, body: Value) {
        let _ = self.0.send(Ok(body.to_string().into_bytes()));
    }

    pub fn send_error(&self, error: TransportError) {
        let _ = self.0.send(Err(error));
    }

    /// Whether the subscription side has gone away.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Subscription transport answering each `subscribe` with the next
/// scripted stream.
#[derive(Default)]
pub struct MockSubscriptionTransport {
    scripted: Mutex<VecDeque<Result<PayloadStream, TransportError>>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl std::fmt::Debug for MockSubscriptionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSubscriptionTransport")
            .field("requests", &self.request_count())
            .finish_non_exhaustive()
    }
}

impl MockSubscriptionTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, scripted: Result<PayloadStream, TransportError>) {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(scripted);
    }

    /// Queue a stream that yields `bodies` and then ends.
    pub fn push_payloads(&self, bodies: Vec<Value>) {
        let payloads: Vec<Result<Vec<u8>, TransportError>> = bodies
            .into_iter()
            .map(|body| Ok(body.to_string().into_bytes()))
            .collect();
        self.push(Ok(stream::iter(payloads).boxed()));
    }

    /// Queue a stream fed by the returned sender.
    pub fn push_channel(&self) -> PayloadSender {
        let (tx, rx) = mpsc::unbounded_channel();
        let payloads = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        });
        self.push(Ok(payloads.boxed()));
        PayloadSender(tx)
    }

    /// Refuse the next subscription.
    pub fn push_refusal(&self, error: TransportError) {
        self.push(Err(error));
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SubscriptionTransport for MockSubscriptionTransport {
    async fn subscribe(&self, request: TransportRequest) -> Result<PayloadStream, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                Err(TransportError::Io {
                    reason: "no scripted subscription".to_string(),
                })
            })
    }
}

// ============================================================================
// KEY RESOLVER
// ============================================================================

/// Identifies objects by their `id` field, and `field(id: ...)` arguments
/// by the same id.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdFieldCacheKeyResolver;

impl CacheKeyResolver for IdFieldCacheKeyResolver {
    fn from_object(
        &self,
        _field: &ResponseField,
        object: &Map<String, Value>,
    ) -> Result<CacheKey, ResolverError> {
        Ok(match object.get("id").and_then(Value::as_str) {
            Some(id) => CacheKey::from(id),
            None => CacheKey::NoKey,
        })
    }

    fn from_arguments(
        &self,
        field: &ResponseField,
        variables: &Variables,
    ) -> Result<CacheKey, ResolverError> {
        if field.arguments.is_empty() {
            return Ok(CacheKey::NoKey);
        }
        let resolved = strata_core::resolve_arguments(&field.arguments, variables);
        Ok(match resolved.get("id").and_then(Value::as_str) {
            Some(id) => CacheKey::from(id),
            None => CacheKey::NoKey,
        })
    }
}

// ============================================================================
// FIXTURE OPERATIONS
// ============================================================================

pub mod operations {
    //! Operations over a small schema:
    //!
    //! ```text
    //! query HeroName { hero { __typename name } }
    //! query HeroAndFriends($episode: Episode) {
    //!   hero(episode: $episode) { __typename id name friends { __typename id name } }
    //! }
    //! query Character($id: ID!) { character(id: $id) { __typename id name } }
    //! mutation UpdateHeroName($id: ID!, $name: String!) {
    //!   updateHero(id: $id, name: $name) { __typename id name }
    //! }
    //! subscription HeroNameChanged { heroNameChanged { __typename id name } }
    //! ```

    use once_cell::sync::Lazy;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use strata_core::{variable_reference, Operation, OperationDescriptor, OperationKind, ResponseField, Variables};

    fn character_fields() -> Vec<ResponseField> {
        vec![
            ResponseField::scalar("__typename"),
            ResponseField::scalar("id"),
            ResponseField::scalar("name"),
        ]
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Character {
        #[serde(rename = "__typename")]
        pub typename: String,
        pub id: String,
        pub name: String,
    }

    impl Character {
        pub fn new(typename: &str, id: &str, name: &str) -> Self {
            Self {
                typename: typename.to_string(),
                id: id.to_string(),
                name: name.to_string(),
            }
        }
    }

    // ---- HeroName ----

    static HERO_NAME_SELECTIONS: Lazy<Vec<ResponseField>> = Lazy::new(|| {
        vec![ResponseField::object(
            "hero",
            vec![ResponseField::scalar("__typename"), ResponseField::scalar("name")],
        )]
    });

    #[derive(Debug, Clone, Copy, Default)]
    pub struct HeroNameQuery;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HeroName {
        #[serde(rename = "__typename")]
        pub typename: String,
        pub name: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HeroNameData {
        pub hero: Option<HeroName>,
    }

    impl OperationDescriptor for HeroNameQuery {
        fn name(&self) -> &str {
            "HeroName"
        }
        fn kind(&self) -> OperationKind {
            OperationKind::Query
        }
        fn document(&self) -> &str {
            "query HeroName { hero { __typename name } }"
        }
        fn variables(&self) -> Variables {
            Variables::new()
        }
        fn selections(&self) -> &[ResponseField] {
            &HERO_NAME_SELECTIONS
        }
    }

    impl Operation for HeroNameQuery {
        type Data = HeroNameData;
    }

    // ---- HeroAndFriends ----

    static HERO_AND_FRIENDS_SELECTIONS: Lazy<Vec<ResponseField>> = Lazy::new(|| {
        let mut hero = character_fields();
        hero.push(ResponseField::object_list("friends", character_fields()));
        vec![ResponseField::object("hero", hero)
            .arguments(json!({"episode": variable_reference("episode")}))]
    });

    #[derive(Debug, Clone, Default)]
    pub struct HeroAndFriendsQuery {
        pub episode: Option<String>,
    }

    impl HeroAndFriendsQuery {
        pub fn episode(episode: &str) -> Self {
            Self {
                episode: Some(episode.to_string()),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HeroWithFriends {
        #[serde(rename = "__typename")]
        pub typename: String,
        pub id: String,
        pub name: String,
        pub friends: Option<Vec<Option<Character>>>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HeroAndFriendsData {
        pub hero: Option<HeroWithFriends>,
    }

    impl HeroAndFriendsData {
        pub fn friend_names(&self) -> Vec<String> {
            self.hero
                .iter()
                .flat_map(|hero| hero.friends.iter().flatten().flatten())
                .map(|friend| friend.name.clone())
                .collect()
        }
    }

    impl OperationDescriptor for HeroAndFriendsQuery {
        fn name(&self) -> &str {
            "HeroAndFriends"
        }
        fn kind(&self) -> OperationKind {
            OperationKind::Query
        }
        fn document(&self) -> &str {
            "query HeroAndFriends($episode: Episode) { hero(episode: $episode) { __typename id name friends { __typename id name } } }"
        }
        fn variables(&self) -> Variables {
            let mut variables = Variables::new();
            if let Some(episode) = &self.episode {
                variables.insert("episode".to_string(), json!(episode));
            }
            variables
        }
        fn selections(&self) -> &[ResponseField] {
            &HERO_AND_FRIENDS_SELECTIONS
        }
    }

    impl Operation for HeroAndFriendsQuery {
        type Data = HeroAndFriendsData;
    }

    // ---- Character ----

    static CHARACTER_SELECTIONS: Lazy<Vec<ResponseField>> = Lazy::new(|| {
        vec![ResponseField::object("character", character_fields())
            .arguments(json!({"id": variable_reference("id")}))]
    });

    #[derive(Debug, Clone)]
    pub struct CharacterQuery {
        pub id: String,
    }

    impl CharacterQuery {
        pub fn new(id: &str) -> Self {
            Self { id: id.to_string() }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CharacterData {
        pub character: Option<Character>,
    }

    impl OperationDescriptor for CharacterQuery {
        fn name(&self) -> &str {
            "Character"
        }
        fn kind(&self) -> OperationKind {
            OperationKind::Query
        }
        fn document(&self) -> &str {
            "query Character($id: ID!) { character(id: $id) { __typename id name } }"
        }
        fn variables(&self) -> Variables {
            let mut variables = Variables::new();
            variables.insert("id".to_string(), json!(self.id));
            variables
        }
        fn selections(&self) -> &[ResponseField] {
            &CHARACTER_SELECTIONS
        }
    }

    impl Operation for CharacterQuery {
        type Data = CharacterData;
    }

    // ---- UpdateHeroName ----

    static UPDATE_HERO_NAME_SELECTIONS: Lazy<Vec<ResponseField>> = Lazy::new(|| {
        vec![ResponseField::object("updateHero", character_fields()).arguments(json!({
            "id": variable_reference("id"),
            "name": variable_reference("name"),
        }))]
    });

    #[derive(Debug, Clone)]
    pub struct UpdateHeroNameMutation {
        pub id: String,
        pub name: String,
    }

    impl UpdateHeroNameMutation {
        pub fn new(id: &str, name: &str) -> Self {
            Self {
                id: id.to_string(),
                name: name.to_string(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct UpdateHeroNameData {
        #[serde(rename = "updateHero")]
        pub update_hero: Option<Character>,
    }

    impl OperationDescriptor for UpdateHeroNameMutation {
        fn name(&self) -> &str {
            "UpdateHeroName"
        }
        fn kind(&self) -> OperationKind {
            OperationKind::Mutation
        }
        fn document(&self) -> &str {
            "mutation UpdateHeroName($id: ID!, $name: String!) { updateHero(id: $id, name: $name) { __typename id name } }"
        }
        fn variables(&self) -> Variables {
            let mut variables = Variables::new();
            variables.insert("id".to_string(), json!(self.id));
            variables.insert("name".to_string(), json!(self.name));
            variables
        }
        fn selections(&self) -> &[ResponseField] {
            &UPDATE_HERO_NAME_SELECTIONS
        }
    }

    impl Operation for UpdateHeroNameMutation {
        type Data = UpdateHeroNameData;
    }

    // ---- HeroNameChanged ----

    static HERO_NAME_CHANGED_SELECTIONS: Lazy<Vec<ResponseField>> =
        Lazy::new(|| vec![ResponseField::object("heroNameChanged", character_fields())]);

    #[derive(Debug, Clone, Copy, Default)]
    pub struct HeroNameChangedSubscription;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HeroNameChangedData {
        #[serde(rename = "heroNameChanged")]
        pub hero_name_changed: Option<Character>,
    }

    impl OperationDescriptor for HeroNameChangedSubscription {
        fn name(&self) -> &str {
            "HeroNameChanged"
        }
        fn kind(&self) -> OperationKind {
            OperationKind::Subscription
        }
        fn document(&self) -> &str {
            "subscription HeroNameChanged { heroNameChanged { __typename id name } }"
        }
        fn variables(&self) -> Variables {
            Variables::new()
        }
        fn selections(&self) -> &[ResponseField] {
            &HERO_NAME_CHANGED_SELECTIONS
        }
    }

    impl Operation for HeroNameChangedSubscription {
        type Data = HeroNameChangedData;
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Canned response bodies and data trees.

    use serde_json::{json, Value};

    pub const HERO_ID: &str = "2001";

    pub fn hero_name_body(name: &str) -> Value {
        json!({"data": {"hero": {"__typename": "Droid", "name": name}}})
    }

    pub fn friend(id: &str, name: &str) -> Value {
        json!({"__typename": "Human", "id": id, "name": name})
    }

    pub fn hero_and_friends_data(name: &str, friends: Vec<Value>) -> Value {
        json!({
            "hero": {
                "__typename": "Droid",
                "id": HERO_ID,
                "name": name,
                "friends": friends,
            }
        })
    }

    /// R2-D2 with Luke, Han and Leia.
    pub fn r2d2_and_friends() -> Value {
        hero_and_friends_data(
            "R2-D2",
            vec![
                friend("1000", "Luke Skywalker"),
                friend("1002", "Han Solo"),
                friend("1003", "Leia Organa"),
            ],
        )
    }

    pub fn hero_and_friends_body(data: Value) -> Value {
        json!({ "data": data })
    }

    pub fn update_hero_name_body(name: &str) -> Value {
        json!({"data": {"updateHero": {"__typename": "Droid", "id": HERO_ID, "name": name}}})
    }

    pub fn hero_name_changed_body(name: &str) -> Value {
        json!({"data": {"heroNameChanged": {"__typename": "Droid", "id": HERO_ID, "name": name}}})
    }

    pub fn error_body(message: &str) -> Value {
        json!({"data": null, "errors": [{"message": message}]})
    }

    /// Data alongside an `errors` array.
    pub fn partial_body(data: Value, message: &str) -> Value {
        json!({"data": data, "errors": [{"message": message}]})
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for records and data trees.

    use proptest::prelude::*;
    use serde_json::{json, Value};
    use strata_core::{FieldValue, Record};
    use uuid::Uuid;

    pub fn arb_uuid_v7() -> impl Strategy<Value = Uuid> {
        Just(()).prop_map(|_| Uuid::now_v7())
    }

    pub fn arb_field_name() -> impl Strategy<Value = String> {
        "[a-z][a-zA-Z]{0,8}"
    }

    pub fn arb_record_key() -> impl Strategy<Value = String> {
        "[0-9]{1,5}"
    }

    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            "[ -~]{0,16}".prop_map(Value::String),
        ]
    }

    pub fn arb_field_value() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            Just(FieldValue::Null),
            arb_scalar().prop_map(FieldValue::Scalar),
            arb_record_key().prop_map(FieldValue::reference),
            prop::collection::vec(arb_scalar().prop_map(FieldValue::Scalar), 0..4)
                .prop_map(FieldValue::List),
        ]
    }

    pub fn arb_record(key: String) -> impl Strategy<Value = Record> {
        prop::collection::btree_map(arb_field_name(), arb_field_value(), 0..6).prop_map(
            move |fields| {
                fields
                    .into_iter()
                    .fold(Record::builder(key.clone()), |builder, (name, value)| {
                        builder.field(name, value)
                    })
                    .build()
            },
        )
    }

    /// A hero with up to five uniquely identified friends.
    pub fn arb_hero_and_friends() -> impl Strategy<Value = Value> {
        (
            "[A-Z][a-z]{1,8}",
            prop::collection::btree_map("1[0-9]{3}", "[A-Z][a-z]{1,8}", 0..5),
        )
            .prop_map(|(name, friends)| {
                let friends = friends
                    .into_iter()
                    .map(|(id, name)| super::fixtures::friend(&id, &name))
                    .collect();
                super::fixtures::hero_and_friends_data(&name, friends)
            })
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on STRATA results.

    use super::*;

    pub fn assert_cache_miss<T: std::fmt::Debug>(result: &StrataResult<T>) {
        assert!(
            matches!(result, Err(StrataError::CacheMiss { .. })),
            "expected cache miss, got {result:?}"
        );
    }

    pub fn assert_network_error<T: std::fmt::Debug>(result: &StrataResult<T>) {
        assert!(
            matches!(result, Err(StrataError::Network { .. })),
            "expected network error, got {result:?}"
        );
    }

    pub fn assert_http_status<T: std::fmt::Debug>(result: &StrataResult<T>, expected: u16) {
        match result {
            Err(StrataError::Http { status, .. }) => assert_eq!(*status, expected),
            other => panic!("expected HTTP {expected}, got {other:?}"),
        }
    }

    pub fn assert_canceled<T: std::fmt::Debug>(result: &StrataResult<T>) {
        assert!(
            matches!(result, Err(StrataError::Canceled { .. })),
            "expected cancellation, got {result:?}"
        );
    }

    pub fn assert_illegal_state<T: std::fmt::Debug>(result: &StrataResult<T>) {
        assert!(
            matches!(result, Err(StrataError::IllegalState { .. })),
            "expected illegal state, got {result:?}"
        );
    }

    pub fn assert_from_source<D>(response: &Response<D>, source: FetchSource) {
        assert_eq!(response.source, source, "unexpected response source");
    }
}
