//! Truncation: snapshot-covered events go, everything needed stays.

use std::time::Duration;

use fleuve::store::{EventStore, OffsetStore};
use fleuve::{MemoryStore, TruncationService, WorkflowId};

use crate::support::repo;
use crate::support::workflows::{OrderCommand, OrderWorkflow};

async fn seed_snapshotted_order(store: &MemoryStore, wid: &str, extra_events: usize) {
    let repo = repo::<OrderWorkflow>(store).with_snapshot_interval(1);
    let wid = WorkflowId::new(wid);
    repo.create_new(
        &wid,
        &OrderCommand::Place {
            items: vec!["a".to_owned()],
            total: 10.0,
        },
        vec![],
    )
    .await
    .unwrap();
    for i in 0..extra_events {
        repo.process_command(&wid, &OrderCommand::AddItem {
            sku: format!("sku-{i}"),
        })
        .await
        .unwrap();
    }
}

fn service(store: &MemoryStore, retention: Duration) -> TruncationService<MemoryStore> {
    TruncationService::new(store.clone(), "order").with_min_retention(retention)
}

#[tokio::test]
async fn truncation_preserves_state_and_reader_positions() {
    let store = MemoryStore::new();
    seed_snapshotted_order(&store, "ord-1", 3).await;
    let wid = WorkflowId::new("ord-1");
    let repo = repo::<OrderWorkflow>(&store);
    let before = repo.load_state(&wid, None).await.unwrap().unwrap();

    // Every reader has consumed the whole log.
    let head = store.max_global_id().await.unwrap();
    store.set_offset("order.0.of.1", head).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let deleted = service(&store, Duration::ZERO).truncate_once().await.unwrap();
    assert_eq!(deleted, 4);
    assert!(
        store
            .events_for_workflow(&wid, None)
            .await
            .unwrap()
            .is_empty()
    );

    // Snapshot-assisted load still equals the pre-truncation state.
    let after = repo.load_state(&wid, None).await.unwrap().unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.state, before.state);

    // No reader's next-unread event was deleted (they were all past it),
    // and the version counter is untouched.
    assert_eq!(store.latest_version(&wid).await.unwrap(), 4);

    // New commands keep appending on top of the snapshot.
    repo.process_command(&wid, &OrderCommand::Ship).await.unwrap();
    let latest = repo.load_state(&wid, None).await.unwrap().unwrap();
    assert_eq!(latest.version, 5);
    assert_eq!(latest.state.data.status, "shipped");
}

#[tokio::test]
async fn unconsumed_events_are_never_deleted() {
    let store = MemoryStore::new();
    seed_snapshotted_order(&store, "ord-1", 3).await;
    let wid = WorkflowId::new("ord-1");

    // The only reader is still positioned at global id 2.
    store.set_offset("order.0.of.1", 2).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let deleted = service(&store, Duration::ZERO).truncate_once().await.unwrap();
    assert_eq!(deleted, 2);

    let remaining = store.events_for_workflow(&wid, None).await.unwrap();
    assert_eq!(remaining.len(), 2);
    // The reader's next-unread event (global id 3) survived.
    assert!(remaining.iter().any(|e| e.global_id == 3));
}

#[tokio::test]
async fn retention_keeps_young_events() {
    let store = MemoryStore::new();
    seed_snapshotted_order(&store, "ord-1", 2).await;
    let head = store.max_global_id().await.unwrap();
    store.set_offset("order.0.of.1", head).await.unwrap();

    let deleted = service(&store, Duration::from_secs(3600))
        .truncate_once()
        .await
        .unwrap();
    assert_eq!(deleted, 0);
}

#[tokio::test]
async fn without_readers_nothing_is_deleted() {
    let store = MemoryStore::new();
    seed_snapshotted_order(&store, "ord-1", 2).await;

    let deleted = service(&store, Duration::ZERO).truncate_once().await.unwrap();
    assert_eq!(deleted, 0);
}

#[tokio::test]
async fn batch_size_bounds_one_cycle() {
    let store = MemoryStore::new();
    seed_snapshotted_order(&store, "ord-1", 5).await;
    let head = store.max_global_id().await.unwrap();
    store.set_offset("order.0.of.1", head).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let service = TruncationService::new(store.clone(), "order")
        .with_min_retention(Duration::ZERO)
        .with_config(&fleuve::EngineConfig {
            truncation_min_retention: Duration::ZERO,
            truncation_batch_size: 2,
            ..fleuve::EngineConfig::default()
        });

    assert_eq!(service.truncate_once().await.unwrap(), 2);
    assert_eq!(service.truncate_once().await.unwrap(), 2);
    assert_eq!(service.truncate_once().await.unwrap(), 2);
    assert_eq!(service.truncate_once().await.unwrap(), 0);
}
