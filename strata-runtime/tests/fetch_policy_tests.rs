//! Fetch-policy behavior through the full interceptor pipeline.

use std::sync::Arc;

use serde_json::json;
use strata_core::{CacheHeaders, FetchPolicy, FetchSource, StrataError};
use strata_runtime::{CallEvent, TransportError};
use strata_test_utils::assertions::{
    assert_cache_miss, assert_from_source, assert_http_status, assert_network_error,
};
use strata_test_utils::fixtures;
use strata_test_utils::operations::{HeroAndFriendsQuery, HeroNameQuery};
use strata_test_utils::MockTransport;

#[path = "support/client.rs"]
mod client_support;
use client_support::{seed_r2d2, test_client};

fn io_error() -> TransportError {
    TransportError::Io {
        reason: "connection refused".to_string(),
    }
}

// ============================================================================
// CACHE_FIRST / CACHE_ONLY / NETWORK_ONLY
// ============================================================================

#[tokio::test]
async fn test_cache_first_fetches_once_then_serves_from_cache() {
    let transport = Arc::new(MockTransport::new());
    transport.push_json(fixtures::hero_and_friends_body(fixtures::r2d2_and_friends()));
    let client = test_client(transport.clone());

    let first = client
        .query(HeroAndFriendsQuery::episode("JEDI"))
        .fetch()
        .await
        .unwrap();
    assert_from_source(&first, FetchSource::Network);

    let second = client
        .query(HeroAndFriendsQuery::episode("JEDI"))
        .fetch()
        .await
        .unwrap();
    assert_from_source(&second, FetchSource::Cache);
    assert_eq!(first.data, second.data);
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn test_cache_only_miss_never_touches_network() {
    let transport = Arc::new(MockTransport::new());
    let client = test_client(transport.clone());

    let result = client
        .query(HeroNameQuery)
        .fetch_policy(FetchPolicy::CacheOnly)
        .fetch()
        .await;
    assert_cache_miss(&result);
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn test_network_only_ignores_cache() {
    let transport = Arc::new(MockTransport::new());
    transport.push_json(fixtures::hero_name_body("R2-D2"));
    transport.push_json(fixtures::hero_name_body("Artoo"));
    let client = test_client(transport.clone());

    for expected in ["R2-D2", "Artoo"] {
        let response = client
            .query(HeroNameQuery)
            .fetch_policy(FetchPolicy::NetworkOnly)
            .fetch()
            .await
            .unwrap();
        assert_from_source(&response, FetchSource::Network);
        assert_eq!(response.data.unwrap().hero.unwrap().name, expected);
    }
    assert_eq!(transport.request_count(), 2);
}

// ============================================================================
// NETWORK_FIRST
// ============================================================================

#[tokio::test]
async fn test_network_first_falls_back_to_cache() {
    let transport = Arc::new(MockTransport::new());
    transport.push_error(io_error());
    let client = test_client(transport.clone());
    seed_r2d2(&client).await;

    let response = client
        .query(HeroAndFriendsQuery::episode("JEDI"))
        .fetch_policy(FetchPolicy::NetworkFirst)
        .fetch()
        .await
        .unwrap();
    assert_from_source(&response, FetchSource::Cache);
    assert_eq!(response.data.unwrap().hero.unwrap().name, "R2-D2");
}

#[tokio::test]
async fn test_network_first_reports_network_error_when_cache_misses_too() {
    let transport = Arc::new(MockTransport::new());
    transport.push_error(io_error());
    let client = test_client(transport);

    let result = client
        .query(HeroNameQuery)
        .fetch_policy(FetchPolicy::NetworkFirst)
        .fetch()
        .await;
    assert_network_error(&result);
}

// ============================================================================
// CACHE_AND_NETWORK
// ============================================================================

#[tokio::test]
async fn test_cache_and_network_delivers_cache_before_network() {
    let transport = Arc::new(MockTransport::new());
    transport.push_json(fixtures::hero_and_friends_body(fixtures::hero_and_friends_data(
        "Artoo",
        vec![fixtures::friend("1000", "Luke Skywalker")],
    )));
    let client = test_client(transport);
    seed_r2d2(&client).await;

    let stream = client
        .query(HeroAndFriendsQuery::episode("JEDI"))
        .fetch_policy(FetchPolicy::CacheAndNetwork)
        .execute()
        .unwrap();
    let events = stream.collect_events().await;

    assert_eq!(events.len(), 5, "unexpected events: {events:?}");
    assert!(matches!(events[0], CallEvent::Fetch(FetchSource::Cache)));
    match &events[1] {
        CallEvent::Response(response) => {
            assert_from_source(response, FetchSource::Cache);
            assert_eq!(response.data.as_ref().unwrap().hero.as_ref().unwrap().name, "R2-D2");
        }
        other => panic!("expected cache response, got {other:?}"),
    }
    assert!(matches!(events[2], CallEvent::Fetch(FetchSource::Network)));
    match &events[3] {
        CallEvent::Response(response) => {
            assert_from_source(response, FetchSource::Network);
            assert_eq!(response.data.as_ref().unwrap().friend_names(), vec!["Luke Skywalker"]);
        }
        other => panic!("expected network response, got {other:?}"),
    }
    assert!(matches!(events[4], CallEvent::Completed));
}

#[tokio::test]
async fn test_cache_and_network_swallows_cache_miss() {
    let transport = Arc::new(MockTransport::new());
    transport.push_json(fixtures::hero_name_body("R2-D2"));
    let client = test_client(transport);

    let events = client
        .query(HeroNameQuery)
        .fetch_policy(FetchPolicy::CacheAndNetwork)
        .execute()
        .unwrap()
        .collect_events()
        .await;

    let responses: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            CallEvent::Response(r) => Some(r.source),
            _ => None,
        })
        .collect();
    assert_eq!(responses, vec![FetchSource::Network]);
    assert!(!events.iter().any(|e| matches!(e, CallEvent::Failure(_))));
    assert!(matches!(events.last(), Some(CallEvent::Completed)));
}

#[tokio::test]
async fn test_cache_and_network_surfaces_network_failure_after_cache_response() {
    let transport = Arc::new(MockTransport::new());
    transport.push_error(io_error());
    let client = test_client(transport);
    seed_r2d2(&client).await;

    let events = client
        .query(HeroAndFriendsQuery::episode("JEDI"))
        .fetch_policy(FetchPolicy::CacheAndNetwork)
        .execute()
        .unwrap()
        .collect_events()
        .await;

    let response_at = events
        .iter()
        .position(|e| matches!(e, CallEvent::Response(r) if r.source == FetchSource::Cache))
        .expect("cache response");
    let failure_at = events
        .iter()
        .position(|e| matches!(e, CallEvent::Failure(StrataError::Network { .. })))
        .expect("network failure");
    assert!(response_at < failure_at);
    assert!(!events.iter().any(|e| matches!(e, CallEvent::Completed)));
}

// ============================================================================
// RESPONSE HANDLING
// ============================================================================

#[tokio::test]
async fn test_responses_with_errors_are_not_cached_by_default() {
    let transport = Arc::new(MockTransport::new());
    transport.push_json(fixtures::partial_body(
        json!({"hero": {"__typename": "Droid", "name": "R2-D2"}}),
        "friends unavailable",
    ));
    let client = test_client(transport);

    let response = client
        .query(HeroNameQuery)
        .fetch_policy(FetchPolicy::NetworkOnly)
        .fetch()
        .await
        .unwrap();
    assert!(response.has_errors());
    assert!(response.data.is_some());

    let cached = client
        .query(HeroNameQuery)
        .fetch_policy(FetchPolicy::CacheOnly)
        .fetch()
        .await;
    assert_cache_miss(&cached);
}

#[tokio::test]
async fn test_partial_responses_are_cached_when_allowed() {
    let transport = Arc::new(MockTransport::new());
    transport.push_json(fixtures::partial_body(
        json!({"hero": {"__typename": "Droid", "name": "R2-D2"}}),
        "friends unavailable",
    ));
    let client = test_client(transport);
    let headers = CacheHeaders::builder()
        .enable(CacheHeaders::STORE_PARTIAL_RESPONSES)
        .build();

    client
        .query(HeroNameQuery)
        .fetch_policy(FetchPolicy::NetworkOnly)
        .cache_headers(headers)
        .fetch()
        .await
        .unwrap();

    let cached = client
        .query(HeroNameQuery)
        .fetch_policy(FetchPolicy::CacheOnly)
        .fetch()
        .await
        .unwrap();
    assert_eq!(cached.data.unwrap().hero.unwrap().name, "R2-D2");
}

#[tokio::test]
async fn test_do_not_store_skips_cache_write() {
    let transport = Arc::new(MockTransport::new());
    transport.push_json(fixtures::hero_name_body("R2-D2"));
    let client = test_client(transport);
    let headers = CacheHeaders::builder()
        .enable(CacheHeaders::DO_NOT_STORE)
        .build();

    client
        .query(HeroNameQuery)
        .fetch_policy(FetchPolicy::NetworkOnly)
        .cache_headers(headers)
        .fetch()
        .await
        .unwrap();

    let cached = client
        .query(HeroNameQuery)
        .fetch_policy(FetchPolicy::CacheOnly)
        .fetch()
        .await;
    assert_cache_miss(&cached);
}

#[tokio::test]
async fn test_null_data_with_errors_is_a_response() {
    let transport = Arc::new(MockTransport::new());
    transport.push_json(fixtures::error_body("hero not found"));
    let client = test_client(transport);

    let response = client
        .query(HeroNameQuery)
        .fetch_policy(FetchPolicy::NetworkOnly)
        .fetch()
        .await
        .unwrap();
    assert!(response.data.is_none());
    assert_eq!(response.errors[0].message, "hero not found");
}

#[tokio::test]
async fn test_http_error_keeps_status() {
    let transport = Arc::new(MockTransport::new());
    transport.push_error(TransportError::Http {
        status: 500,
        message: "Internal Server Error".to_string(),
        body: Some(b"oops".to_vec()),
    });
    let client = test_client(transport);

    let result = client
        .query(HeroNameQuery)
        .fetch_policy(FetchPolicy::NetworkOnly)
        .fetch()
        .await;
    assert_http_status(&result, 500);
}

#[tokio::test]
async fn test_unparseable_body_is_parse_error() {
    let transport = Arc::new(MockTransport::new());
    transport.push_raw(b"<html>bad gateway</html>");
    let client = test_client(transport);

    let result = client
        .query(HeroNameQuery)
        .fetch_policy(FetchPolicy::NetworkOnly)
        .fetch()
        .await;
    assert!(matches!(result, Err(StrataError::Parse { .. })), "got {result:?}");
}

#[tokio::test]
async fn test_request_body_carries_variables_and_hash() {
    let transport = Arc::new(MockTransport::new());
    transport.push_json(fixtures::hero_and_friends_body(fixtures::r2d2_and_friends()));
    transport.push_json(fixtures::hero_and_friends_body(fixtures::r2d2_and_friends()));
    let client = test_client(transport.clone());

    let query = HeroAndFriendsQuery::episode("JEDI");
    client.query(query.clone()).fetch_policy(FetchPolicy::NetworkOnly).fetch().await.unwrap();
    client
        .query(query)
        .fetch_policy(FetchPolicy::NetworkOnly)
        .send_query_document(false)
        .fetch()
        .await
        .unwrap();

    let bodies = transport.request_bodies();
    assert_eq!(bodies[0]["operationName"], json!("HeroAndFriends"));
    assert_eq!(bodies[0]["variables"], json!({"episode": "JEDI"}));
    assert!(bodies[0]["query"].is_string());
    assert_eq!(bodies[0]["extensions"]["persistedQuery"]["version"], json!(1));
    assert!(bodies[1].get("query").is_none());
    assert_eq!(
        bodies[0]["extensions"]["persistedQuery"]["sha256Hash"],
        bodies[1]["extensions"]["persistedQuery"]["sha256Hash"]
    );
}
