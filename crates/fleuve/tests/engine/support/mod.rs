//! Shared fixtures for the engine tests.


use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleuve::{EngineConfig, MemoryStateCache, MemoryStore, Repository, RetryPolicy, Workflow};

/// Engine config tuned for fast tests: tight polls, no jitter, millisecond
/// backoffs.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        reader_poll_interval: Duration::from_millis(5),
        reader_max_poll_interval: Duration::from_millis(20),
        delay_poll_interval: Duration::from_millis(5),
        retry_policy: RetryPolicy {
            max_retries: 3,
            factor: 2.0,
            min: Duration::from_millis(10),
            max: Duration::from_millis(100),
            jitter: 0.0,
            ..RetryPolicy::default()
        },
        ..EngineConfig::default()
    }
}

pub fn repo<W: Workflow>(store: &MemoryStore) -> Repository<W, MemoryStore> {
    Repository::new(store.clone(), Arc::new(MemoryStateCache::new()))
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
