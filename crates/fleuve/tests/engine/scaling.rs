//! Scaling: offset migration and coordinated runner stops.

use std::time::Duration;

use fleuve::store::{OffsetStore, ScalingStore};
use fleuve::{
    ActionExecutor, DelayScheduler, EngineConfig, MemoryStore, Reader, WorkflowId,
    WorkflowRunner, make_reader_name, rebalance,
};
use tokio::sync::watch;

use crate::support::repo;
use crate::support::workflows::{NoopAdapter, OrderCommand, OrderWorkflow};

async fn seed_orders(store: &MemoryStore, count: usize) {
    let orders = repo::<OrderWorkflow>(store);
    for i in 0..count {
        orders
            .create_new(
                &WorkflowId::new(format!("ord-{i}")),
                &OrderCommand::Place {
                    items: vec!["a".to_owned()],
                    total: 1.0,
                },
                vec![],
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn scale_up_delivers_everything_past_the_slowest_reader() {
    let store = MemoryStore::new();
    seed_orders(&store, 12).await;

    // Three partitions with committed offsets 10, 12, 8.
    for (index, offset) in [(0u32, 10i64), (1, 12), (2, 8)] {
        store
            .set_offset(&make_reader_name("order", index, 3), offset)
            .await
            .unwrap();
    }

    rebalance(&store, "order", 3, 5).await.unwrap();

    // The added readers start at min(10, 12, 8) and re-deliver from there.
    for index in 3..5 {
        let mut reader = Reader::new(make_reader_name("order", index, 5), store.clone());
        let batch = reader.next_batch(100).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|e| e.global_id).collect();
        assert_eq!(ids, vec![9, 10, 11, 12]);
    }

    // Together, the new layout covers every event past the slowest offset
    // at least once.
    let mut covered = std::collections::BTreeSet::new();
    for index in 0..5 {
        let mut reader = Reader::new(make_reader_name("order", index, 5), store.clone());
        for event in reader.next_batch(100).await.unwrap() {
            covered.insert(event.global_id);
        }
    }
    assert!((9..=12).all(|id| covered.contains(&id)));
}

#[tokio::test]
async fn second_claimant_of_a_reader_name_aborts() {
    let store = MemoryStore::new();
    seed_orders(&store, 3).await;

    let mut first = Reader::new("order.0.of.1", store.clone());
    first.next_batch(100).await.unwrap();
    first.commit(first.position()).await.unwrap();

    // A second process claims the same reader but is behind: its commit is
    // rejected instead of rolling the offset back.
    let err = store.commit_offset("order.0.of.1", 1).await.unwrap_err();
    assert!(matches!(err, fleuve::Error::Configuration(_)));
}

#[tokio::test]
async fn runner_stops_at_the_scaling_target_offset() {
    let store = MemoryStore::new();
    seed_orders(&store, 4).await;
    let head = 4;
    store
        .create_scaling_operation("order", head)
        .await
        .unwrap();
    assert_eq!(
        store.active_scaling_target("order").await.unwrap(),
        Some(head)
    );

    let repo = repo::<OrderWorkflow>(&store);
    let executor = ActionExecutor::new(store.clone(), repo.clone(), NoopAdapter::default());
    let scheduler = DelayScheduler::new(store.clone(), repo.clone());
    let config = EngineConfig {
        scaling_check_interval: 1,
        reader_poll_interval: Duration::from_millis(5),
        reader_max_poll_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    };
    let runner = WorkflowRunner::new(store.clone(), repo, executor, scheduler, &config);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(runner.run(shutdown_rx));

    // The runner notices the pending operation and exits on its own once it
    // has scanned up to the target.
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("runner did not stop at target offset")
        .unwrap();
    result.unwrap();

    assert_eq!(
        store.load_offset(&make_reader_name("order", 0, 1)).await.unwrap(),
        head
    );

    store.complete_scaling_operation("order").await.unwrap();
    assert_eq!(store.active_scaling_target("order").await.unwrap(), None);
}
