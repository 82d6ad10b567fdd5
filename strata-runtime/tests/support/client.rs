//! Shared client setup for runtime integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use strata_core::{CacheHeaders, StrataConfig};
use strata_runtime::StrataClient;
use strata_test_utils::operations::HeroAndFriendsQuery;
use strata_test_utils::{fixtures, IdFieldCacheKeyResolver, MockTransport};

pub fn test_client(transport: Arc<MockTransport>) -> StrataClient {
    test_client_with_config(transport, StrataConfig::default())
}

pub fn test_client_with_config(transport: Arc<MockTransport>, config: StrataConfig) -> StrataClient {
    StrataClient::builder()
        .transport(transport)
        .cache_key_resolver(Arc::new(IdFieldCacheKeyResolver))
        .config(config)
        .build()
        .expect("client should build")
}

/// Seed the store with R2-D2 and three friends under episode JEDI.
pub async fn seed_r2d2(client: &StrataClient) {
    client
        .store()
        .write(
            &HeroAndFriendsQuery::episode("JEDI"),
            &fixtures::r2d2_and_friends(),
            &CacheHeaders::none(),
        )
        .await
        .expect("seed write");
}

/// Current cached hero name, if the query can be served from the store.
pub async fn cached_hero_name(client: &StrataClient) -> Option<String> {
    let read = client
        .store()
        .read(&HeroAndFriendsQuery::episode("JEDI"), &CacheHeaders::none())
        .await
        .ok()?;
    read.data["hero"]["name"].as_str().map(str::to_string)
}

/// Poll `check` until it holds, failing the test after about a second.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not reached in time");
}
