//! Subscriptions: store write-through per cache policy, cached first
//! delivery, watcher notification, cancellation and transport failures.

use std::sync::Arc;
use std::time::Duration;

use strata_core::{CacheHeaders, FetchSource, StrataError, SubscriptionFetchPolicy};
use strata_runtime::{CallState, StrataClient, SubscriptionEvent, TransportError};
use strata_storage::StoreExt;
use strata_test_utils::assertions::{assert_cache_miss, assert_illegal_state};
use strata_test_utils::fixtures::{self, HERO_ID};
use strata_test_utils::operations::{
    Character, CharacterQuery, HeroAndFriendsQuery, HeroNameChangedData,
    HeroNameChangedSubscription,
};
use strata_test_utils::{IdFieldCacheKeyResolver, MockSubscriptionTransport, MockTransport};

#[path = "support/client.rs"]
mod client_support;
use client_support::{eventually, test_client};

fn subscription_client(subscriptions: Arc<MockSubscriptionTransport>) -> StrataClient {
    StrataClient::builder()
        .transport(Arc::new(MockTransport::new()))
        .subscription_transport(subscriptions)
        .cache_key_resolver(Arc::new(IdFieldCacheKeyResolver))
        .build()
        .unwrap()
}

async fn cached_character_name(client: &StrataClient) -> Option<String> {
    let read = client
        .store()
        .read_operation(&CharacterQuery::new(HERO_ID), &CacheHeaders::none())
        .await
        .ok()?;
    read.data?.character.map(|c| c.name)
}

fn delivered_names(events: &[SubscriptionEvent<HeroNameChangedData>]) -> Vec<(FetchSource, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            SubscriptionEvent::Response(response) => {
                let name = response.data.as_ref()?.hero_name_changed.as_ref()?.name.clone();
                Some((response.source, name))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_network_only_writes_every_payload() {
    let subscriptions = Arc::new(MockSubscriptionTransport::new());
    let sender = subscriptions.push_channel();
    let client = subscription_client(subscriptions.clone());

    let call = client
        .subscribe(HeroNameChangedSubscription)
        .cache_policy(SubscriptionFetchPolicy::NetworkOnly);
    let mut stream = call.execute().unwrap();
    assert_eq!(stream.next_event().await, Some(SubscriptionEvent::Connected));

    sender.send_json(fixtures::hero_name_changed_body("Artoo"));
    let first = stream.next_response().await.unwrap().unwrap();
    assert_eq!(first.source, FetchSource::Network);
    assert_eq!(cached_character_name(&client).await.as_deref(), Some("Artoo"));

    sender.send_json(fixtures::hero_name_changed_body("Artoo-Detoo"));
    stream.next_response().await.unwrap().unwrap();
    assert_eq!(cached_character_name(&client).await.as_deref(), Some("Artoo-Detoo"));

    drop(sender);
    assert_eq!(stream.next_event().await, Some(SubscriptionEvent::Completed));
    assert_eq!(call.state(), CallState::Terminated);
    assert_eq!(subscriptions.requests()[0].operation_name, "HeroNameChanged");
}

#[tokio::test]
async fn test_no_cache_leaves_store_untouched() {
    let subscriptions = Arc::new(MockSubscriptionTransport::new());
    subscriptions.push_payloads(vec![fixtures::hero_name_changed_body("Artoo")]);
    let client = subscription_client(subscriptions);

    let events = client
        .subscribe(HeroNameChangedSubscription)
        .cache_policy(SubscriptionFetchPolicy::NoCache)
        .execute()
        .unwrap()
        .collect_events()
        .await;

    assert_eq!(delivered_names(&events), vec![(FetchSource::Network, "Artoo".to_string())]);
    assert!(matches!(events.last(), Some(SubscriptionEvent::Completed)));

    let read = client
        .store()
        .read_operation(&CharacterQuery::new(HERO_ID), &CacheHeaders::none())
        .await;
    assert_cache_miss(&read);
}

#[tokio::test]
async fn test_cache_and_network_delivers_cached_value_first() {
    let subscriptions = Arc::new(MockSubscriptionTransport::new());
    subscriptions.push_payloads(vec![fixtures::hero_name_changed_body("Artoo-Detoo")]);
    let client = subscription_client(subscriptions);
    client
        .store()
        .write_operation(
            &HeroNameChangedSubscription,
            &HeroNameChangedData {
                hero_name_changed: Some(Character::new("Droid", HERO_ID, "R2-D2")),
            },
        )
        .await
        .unwrap();

    let events = client
        .subscribe(HeroNameChangedSubscription)
        .cache_policy(SubscriptionFetchPolicy::CacheAndNetwork)
        .execute()
        .unwrap()
        .collect_events()
        .await;

    assert_eq!(
        delivered_names(&events),
        vec![
            (FetchSource::Cache, "R2-D2".to_string()),
            (FetchSource::Network, "Artoo-Detoo".to_string()),
        ]
    );
    assert!(matches!(events[0], SubscriptionEvent::Response(_)));
    assert_eq!(cached_character_name(&client).await.as_deref(), Some("Artoo-Detoo"));
}

#[tokio::test]
async fn test_cache_and_network_skips_to_network_on_cache_miss() {
    let subscriptions = Arc::new(MockSubscriptionTransport::new());
    subscriptions.push_payloads(vec![fixtures::hero_name_changed_body("Artoo")]);
    let client = subscription_client(subscriptions);

    let events = client
        .subscribe(HeroNameChangedSubscription)
        .cache_policy(SubscriptionFetchPolicy::CacheAndNetwork)
        .execute()
        .unwrap()
        .collect_events()
        .await;

    assert!(matches!(events[0], SubscriptionEvent::Connected));
    assert_eq!(delivered_names(&events), vec![(FetchSource::Network, "Artoo".to_string())]);
}

#[tokio::test]
async fn test_payload_with_errors_is_delivered_but_not_written() {
    let subscriptions = Arc::new(MockSubscriptionTransport::new());
    subscriptions.push_payloads(vec![fixtures::partial_body(
        fixtures::hero_name_changed_body("Artoo")["data"].clone(),
        "partial",
    )]);
    let client = subscription_client(subscriptions);

    let events = client
        .subscribe(HeroNameChangedSubscription)
        .execute()
        .unwrap()
        .collect_events()
        .await;

    let response = events
        .iter()
        .find_map(|e| match e {
            SubscriptionEvent::Response(r) => Some(r),
            _ => None,
        })
        .unwrap();
    assert!(response.has_errors());
    assert_eq!(cached_character_name(&client).await, None);
}

#[tokio::test]
async fn test_subscription_payload_wakes_watcher() {
    let transport = Arc::new(MockTransport::new());
    transport.push_json(fixtures::hero_and_friends_body(fixtures::r2d2_and_friends()));
    let subscriptions = Arc::new(MockSubscriptionTransport::new());
    let sender = subscriptions.push_channel();
    let client = StrataClient::builder()
        .transport(transport.clone())
        .subscription_transport(subscriptions)
        .cache_key_resolver(Arc::new(IdFieldCacheKeyResolver))
        .build()
        .unwrap();

    let watcher = client.query(HeroAndFriendsQuery::episode("JEDI")).watcher();
    let mut watched = watcher.watch().unwrap();
    watched.next().await.unwrap().unwrap();

    let _stream = client.subscribe(HeroNameChangedSubscription).execute().unwrap();
    sender.send_json(fixtures::hero_name_changed_body("Artoo"));

    let update = watched.next().await.unwrap().unwrap();
    assert_eq!(update.source, FetchSource::Cache);
    assert_eq!(update.data.unwrap().hero.unwrap().name, "Artoo");
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn test_cancel_stops_delivery_and_closes_stream() {
    let subscriptions = Arc::new(MockSubscriptionTransport::new());
    let sender = subscriptions.push_channel();
    let client = subscription_client(subscriptions);

    let call = client.subscribe(HeroNameChangedSubscription);
    let mut stream = call.execute().unwrap();
    assert_eq!(stream.next_event().await, Some(SubscriptionEvent::Connected));
    assert_eq!(client.active_call_count(), 1);

    call.cancel();
    call.cancel();
    assert!(call.is_canceled());
    sender.send_json(fixtures::hero_name_changed_body("Artoo"));

    assert_eq!(stream.next_event().await, None);
    eventually(|| {
        let closed = sender.is_closed();
        let idle = client.active_call_count() == 0;
        async move { closed && idle }
    })
    .await;
    assert_eq!(cached_character_name(&client).await, None);
}

#[tokio::test]
async fn test_transport_error_fails_the_subscription() {
    let subscriptions = Arc::new(MockSubscriptionTransport::new());
    let sender = subscriptions.push_channel();
    subscriptions.push_refusal(TransportError::Http {
        status: 401,
        message: "Unauthorized".to_string(),
        body: None,
    });
    let client = subscription_client(subscriptions);

    let stream = client.subscribe(HeroNameChangedSubscription).execute().unwrap();
    sender.send_json(fixtures::hero_name_changed_body("Artoo"));
    sender.send_error(TransportError::Io {
        reason: "connection reset".to_string(),
    });
    let events = stream.collect_events().await;
    assert_eq!(delivered_names(&events).len(), 1);
    assert!(matches!(
        events.last(),
        Some(SubscriptionEvent::Failure(StrataError::Network { reason })) if reason.contains("connection reset")
    ));

    let refused = client
        .subscribe(HeroNameChangedSubscription)
        .execute()
        .unwrap()
        .collect_events()
        .await;
    assert!(matches!(
        refused.as_slice(),
        [SubscriptionEvent::Failure(StrataError::Http { status: 401, .. })]
    ));
}

#[tokio::test]
async fn test_execute_rules() {
    let client = test_client(Arc::new(MockTransport::new()));
    let missing = client.subscribe(HeroNameChangedSubscription).execute();
    assert_illegal_state(&missing);

    let subscriptions = Arc::new(MockSubscriptionTransport::new());
    subscriptions.push_payloads(vec![]);
    let client = subscription_client(subscriptions);
    let call = client.subscribe(HeroNameChangedSubscription);
    let stream = call.execute().unwrap();
    assert_illegal_state(&call.execute());

    let events = tokio::time::timeout(Duration::from_secs(1), stream.collect_events())
        .await
        .unwrap();
    assert_eq!(events, vec![SubscriptionEvent::Connected, SubscriptionEvent::Completed]);

    let again = call.clone_call();
    assert_eq!(again.state(), CallState::Idle);
    assert_eq!(again.policy(), SubscriptionFetchPolicy::NetworkOnly);
}
