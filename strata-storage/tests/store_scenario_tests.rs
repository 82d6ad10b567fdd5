//! End-to-end store scenarios over the hero/friends fixtures: round trips,
//! argument redirects, cascading removal, optimistic overlays and change
//! notification.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use strata_core::{CacheHeaders, FieldValue, NoKeyResolver, QUERY_ROOT_KEY};
use strata_storage::{
    LruNormalizedCache, NormalizedCache, NormalizedStore, RecordChangeSubscriber, Store,
    StoreExt,
};
use strata_test_utils::assertions::assert_cache_miss;
use strata_test_utils::fixtures::{self, HERO_ID};
use strata_test_utils::operations::{
    Character, CharacterQuery, HeroAndFriendsQuery, HeroNameQuery, UpdateHeroNameData,
    UpdateHeroNameMutation,
};
use strata_test_utils::IdFieldCacheKeyResolver;
use uuid::Uuid;

fn store() -> NormalizedStore {
    NormalizedStore::new(
        Arc::new(LruNormalizedCache::unbounded()),
        Arc::new(IdFieldCacheKeyResolver),
    )
}

#[derive(Default)]
struct CountingSubscriber {
    calls: AtomicUsize,
}

impl RecordChangeSubscriber for CountingSubscriber {
    fn on_records_changed(&self, _changed_keys: &HashSet<String>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// ROUND TRIPS
// ============================================================================

#[tokio::test]
async fn test_write_then_read_rebuilds_the_same_tree() {
    let store = store();
    let query = HeroAndFriendsQuery::episode("JEDI");
    let data = fixtures::r2d2_and_friends();

    store.write(&query, &data, &CacheHeaders::none()).await.unwrap();
    let read = store.read(&query, &CacheHeaders::none()).await.unwrap();

    assert_eq!(read.data, data);
    assert!(read.dependent_keys.contains(HERO_ID));
    assert!(read.dependent_keys.contains("2001.friends"));
    assert!(read.dependent_keys.contains("1002.name"));
}

#[tokio::test]
async fn test_typed_read_decodes_data() {
    let store = store();
    let query = HeroAndFriendsQuery::episode("JEDI");
    store
        .write(&query, &fixtures::r2d2_and_friends(), &CacheHeaders::none())
        .await
        .unwrap();

    let response = store.read_operation(&query, &CacheHeaders::none()).await.unwrap();
    let data = response.data.as_ref().unwrap();
    assert_eq!(
        data.friend_names(),
        vec!["Luke Skywalker", "Han Solo", "Leia Organa"]
    );
    assert!(response.is_from_cache());
}

#[tokio::test]
async fn test_different_arguments_do_not_share_a_slot() {
    let store = store();
    store
        .write(
            &HeroAndFriendsQuery::episode("JEDI"),
            &fixtures::r2d2_and_friends(),
            &CacheHeaders::none(),
        )
        .await
        .unwrap();

    let other = store
        .read(&HeroAndFriendsQuery::episode("EMPIRE"), &CacheHeaders::none())
        .await;
    assert_cache_miss(&other);
}

#[tokio::test]
async fn test_argument_redirect_reads_record_by_id() {
    let store = store();
    store
        .write(
            &HeroAndFriendsQuery::episode("JEDI"),
            &fixtures::r2d2_and_friends(),
            &CacheHeaders::none(),
        )
        .await
        .unwrap();

    // `character(id: "1002")` was never fetched, but the record is known.
    let read = store
        .read(&CharacterQuery::new("1002"), &CacheHeaders::none())
        .await
        .unwrap();
    assert_eq!(
        read.data,
        json!({"character": {"__typename": "Human", "id": "1002", "name": "Han Solo"}})
    );
}

#[tokio::test]
async fn test_second_identical_write_changes_nothing() {
    let store = store();
    let query = HeroAndFriendsQuery::episode("JEDI");
    let data = fixtures::r2d2_and_friends();

    let first = store.write(&query, &data, &CacheHeaders::none()).await.unwrap();
    let second = store.write(&query, &data, &CacheHeaders::none()).await.unwrap();
    assert!(!first.is_empty());
    assert!(second.is_empty());
}

// ============================================================================
// REMOVAL
// ============================================================================

#[tokio::test]
async fn test_cascading_remove_takes_referenced_records() {
    let store = store();
    store
        .write(
            &HeroAndFriendsQuery::episode("JEDI"),
            &fixtures::r2d2_and_friends(),
            &CacheHeaders::none(),
        )
        .await
        .unwrap();

    assert!(store.remove(HERO_ID, true).await.unwrap());

    assert_cache_miss(&store.read(&CharacterQuery::new("1002"), &CacheHeaders::none()).await);
    assert_cache_miss(
        &store
            .read(&HeroAndFriendsQuery::episode("JEDI"), &CacheHeaders::none())
            .await,
    );
}

#[tokio::test]
async fn test_plain_remove_leaves_referenced_records() {
    let store = store();
    store
        .write(
            &HeroAndFriendsQuery::episode("JEDI"),
            &fixtures::r2d2_and_friends(),
            &CacheHeaders::none(),
        )
        .await
        .unwrap();

    assert!(store.remove(HERO_ID, false).await.unwrap());
    assert!(!store.remove(HERO_ID, false).await.unwrap());
    assert!(store
        .read(&CharacterQuery::new("1002"), &CacheHeaders::none())
        .await
        .is_ok());
}

// ============================================================================
// OPTIMISTIC UPDATES
// ============================================================================

#[tokio::test]
async fn test_optimistic_update_shadows_then_rolls_back() {
    let store = store();
    let query = HeroAndFriendsQuery::episode("JEDI");
    store
        .write(&query, &fixtures::r2d2_and_friends(), &CacheHeaders::none())
        .await
        .unwrap();

    let mutation_id = Uuid::now_v7();
    let optimistic = fixtures::hero_and_friends_data(
        "R2-D2",
        vec![fixtures::friend("1000", "Luke Skywalker")],
    );
    let changed = store.apply_optimistic(&query, &optimistic, mutation_id).await.unwrap();
    assert!(changed.contains("2001.friends"));

    let shadowed = store.read_operation(&query, &CacheHeaders::none()).await.unwrap();
    assert_eq!(shadowed.data.unwrap().friend_names(), vec!["Luke Skywalker"]);

    let restored_keys = store.rollback(mutation_id).await.unwrap();
    assert!(restored_keys.contains("2001.friends"));
    let restored = store.read_operation(&query, &CacheHeaders::none()).await.unwrap();
    assert_eq!(
        restored.data.unwrap().friend_names(),
        vec!["Luke Skywalker", "Han Solo", "Leia Organa"]
    );

    // Rolling back twice is harmless.
    assert!(store.rollback(mutation_id).await.unwrap().is_empty());
}

/// Keys of the hero's `friends` list, in list order.
async fn friend_keys(store: &NormalizedStore) -> Vec<String> {
    store
        .read_transaction(|cache| {
            let headers = CacheHeaders::none();
            let root = cache.load_record(QUERY_ROOT_KEY, &headers)?.unwrap();
            let hero_key = root.references()[0].key().to_string();
            let hero = cache.load_record(&hero_key, &headers)?.unwrap();
            let keys = match hero.field("friends") {
                Some(FieldValue::List(items)) => items
                    .iter()
                    .map(|item| item.as_reference().unwrap().key().to_string())
                    .collect(),
                other => panic!("friends is not a list: {other:?}"),
            };
            Ok(keys)
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_rollback_restores_path_keyed_list() {
    let store = NormalizedStore::new(
        Arc::new(LruNormalizedCache::unbounded()),
        Arc::new(NoKeyResolver),
    );
    let query = HeroAndFriendsQuery::episode("JEDI");
    store
        .write(&query, &fixtures::r2d2_and_friends(), &CacheHeaders::none())
        .await
        .unwrap();

    let hero_key = r#"hero({"episode":"JEDI"})"#;
    let original: Vec<String> = (0..3).map(|i| format!("{hero_key}.friends.{i}")).collect();
    assert_eq!(friend_keys(&store).await, original);

    let mutation_id = Uuid::now_v7();
    let optimistic = fixtures::hero_and_friends_data(
        "R2-D2",
        vec![fixtures::friend("1000", "Luke Skywalker")],
    );
    store.apply_optimistic(&query, &optimistic, mutation_id).await.unwrap();
    assert_eq!(friend_keys(&store).await, vec![format!("{hero_key}.friends.0")]);
    let shadowed = store.read_operation(&query, &CacheHeaders::none()).await.unwrap();
    assert_eq!(shadowed.data.unwrap().friend_names(), vec!["Luke Skywalker"]);

    store.rollback(mutation_id).await.unwrap();
    assert_eq!(friend_keys(&store).await, original);
    let restored = store.read_operation(&query, &CacheHeaders::none()).await.unwrap();
    assert_eq!(
        restored.data.unwrap().friend_names(),
        vec!["Luke Skywalker", "Han Solo", "Leia Organa"]
    );
    assert_eq!(store.cache().pending_keys(), 0);
}

#[tokio::test]
async fn test_network_commit_replaces_optimistic_patch() {
    let store = store();
    let mutation = UpdateHeroNameMutation::new(HERO_ID, "Artoo");
    let query = HeroAndFriendsQuery::episode("JEDI");
    store
        .write(&query, &fixtures::r2d2_and_friends(), &CacheHeaders::none())
        .await
        .unwrap();

    let mutation_id = Uuid::now_v7();
    let optimistic = json!({"updateHero": {"__typename": "Droid", "id": HERO_ID, "name": "Artoo"}});
    store.apply_optimistic(&mutation, &optimistic, mutation_id).await.unwrap();

    let server = json!({"updateHero": {"__typename": "Droid", "id": HERO_ID, "name": "Artoo-Detoo"}});
    let records = store
        .normalizer()
        .normalize_operation(&mutation, &server)
        .unwrap()
        .records;
    let changed = store
        .commit_network_result(records, mutation_id, &CacheHeaders::none())
        .await
        .unwrap();
    assert!(changed.contains("2001.name"));

    let read = store.read(&query, &CacheHeaders::none()).await.unwrap();
    assert_eq!(read.data["hero"]["name"], json!("Artoo-Detoo"));
    assert_eq!(store.cache().pending_keys(), 0);
}

// ============================================================================
// NOTIFICATION
// ============================================================================

#[tokio::test]
async fn test_publish_reaches_only_intersecting_subscribers() {
    let store = store();
    let name_watcher = Arc::new(CountingSubscriber::default());
    let friend_watcher = Arc::new(CountingSubscriber::default());
    store.subscribe(HashSet::from(["2001.name".to_string()]), name_watcher.clone());
    store.subscribe(HashSet::from(["1000.name".to_string()]), friend_watcher.clone());

    let mutation = UpdateHeroNameMutation::new(HERO_ID, "Artoo");
    let data = UpdateHeroNameData {
        update_hero: Some(Character::new("Droid", HERO_ID, "Artoo")),
    };
    let changed = store.write_and_publish(&mutation, &data).await.unwrap();

    assert!(changed.contains("2001.name"));
    assert_eq!(name_watcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(friend_watcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unsubscribed_and_empty_subscribers_are_not_notified() {
    let store = store();
    let gone = Arc::new(CountingSubscriber::default());
    let empty = Arc::new(CountingSubscriber::default());
    let id = store.subscribe(HashSet::from(["hero".to_string()]), gone.clone());
    store.subscribe(HashSet::new(), empty.clone());
    store.unsubscribe(id);

    let data = json!({"hero": {"__typename": "Droid", "name": "R2-D2"}});
    let changed = store
        .write(&HeroNameQuery, &data, &CacheHeaders::none())
        .await
        .unwrap();
    store.publish(&changed);

    assert_eq!(gone.calls.load(Ordering::SeqCst), 0);
    assert_eq!(empty.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_clear_all_empties_the_store() {
    let store = store();
    store
        .write(
            &HeroAndFriendsQuery::episode("JEDI"),
            &fixtures::r2d2_and_friends(),
            &CacheHeaders::none(),
        )
        .await
        .unwrap();
    store.clear_all().await.unwrap();
    assert_cache_miss(&store.read(&CharacterQuery::new("1000"), &CacheHeaders::none()).await);
}
