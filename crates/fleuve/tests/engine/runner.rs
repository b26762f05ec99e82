//! Runner behavior: subscription routing, offsets, partition filtering.

use fleuve::store::{ActivityStore, EventStore};
use fleuve::{
    ActionExecutor, DelayScheduler, MemoryStore, PartitionedRunnerConfig, Workflow, WorkflowId,
    WorkflowRunner, partition_index,
};

use crate::support::workflows::{
    NoopAdapter, OrderCommand, OrderWorkflow, TrackerCommand, TrackerWorkflow,
};
use crate::support::{repo, test_config};

fn tracker_runner(
    store: &MemoryStore,
) -> WorkflowRunner<TrackerWorkflow, NoopAdapter<TrackerWorkflow>, MemoryStore> {
    let repo = repo::<TrackerWorkflow>(store);
    let executor = ActionExecutor::new(store.clone(), repo.clone(), NoopAdapter::default());
    let scheduler = DelayScheduler::new(store.clone(), repo.clone());
    WorkflowRunner::new(store.clone(), repo, executor, scheduler, &test_config())
}

fn place(total: f64) -> OrderCommand {
    OrderCommand::Place {
        items: vec!["a".to_owned()],
        total,
    }
}

#[tokio::test]
async fn subscriber_receives_payment_events_as_commands() {
    let store = MemoryStore::new();
    let orders = repo::<OrderWorkflow>(&store);
    let trackers = repo::<TrackerWorkflow>(&store);

    // A subscribes to payment events from B; B emits one.
    trackers
        .create_new(
            &WorkflowId::new("trk-1"),
            &TrackerCommand::Init {
                source: "ord-1".to_owned(),
            },
            vec![],
        )
        .await
        .unwrap();
    orders
        .create_new(&WorkflowId::new("ord-1"), &place(10.0), vec![])
        .await
        .unwrap();
    orders
        .process_command(&WorkflowId::new("ord-1"), &OrderCommand::Pay {
            payment_id: "p".to_owned(),
        })
        .await
        .unwrap();

    let mut runner = tracker_runner(&store);
    runner.run_until_idle().await.unwrap();

    let tracker = trackers
        .load_state(&WorkflowId::new("trk-1"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tracker.state.data.payments_seen, vec!["ord-1"]);
    // B's log was not touched by A's runner.
    let order_events = store
        .events_for_workflow(&WorkflowId::new("ord-1"), None)
        .await
        .unwrap();
    assert_eq!(order_events.len(), 2);

    // A runner under a different reader name re-delivers everything from
    // offset zero; decide rejects the duplicate and the runner skips it.
    let repo = repo::<TrackerWorkflow>(&store);
    let executor = ActionExecutor::new(store.clone(), repo.clone(), NoopAdapter::default());
    let scheduler = DelayScheduler::new(store.clone(), repo.clone());
    let mut runner = WorkflowRunner::named(
        store.clone(),
        repo,
        executor,
        scheduler,
        &test_config(),
        "tracker.replay",
    );
    runner.run_until_idle().await.unwrap();
    let tracker = trackers
        .load_state(&WorkflowId::new("trk-1"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tracker.state.data.payments_seen.len(), 1);
}

#[tokio::test]
async fn wildcard_subscription_matches_any_source() {
    let store = MemoryStore::new();
    let orders = repo::<OrderWorkflow>(&store);
    let trackers = repo::<TrackerWorkflow>(&store);

    trackers
        .create_new(
            &WorkflowId::new("trk-all"),
            &TrackerCommand::Init {
                source: "*".to_owned(),
            },
            vec![],
        )
        .await
        .unwrap();

    for wid in ["ord-1", "ord-2"] {
        let wid = WorkflowId::new(wid);
        orders.create_new(&wid, &place(5.0), vec![]).await.unwrap();
        orders
            .process_command(&wid, &OrderCommand::Pay {
                payment_id: "p".to_owned(),
            })
            .await
            .unwrap();
    }

    let mut runner = tracker_runner(&store);
    runner.run_until_idle().await.unwrap();

    let tracker = trackers
        .load_state(&WorkflowId::new("trk-all"), None)
        .await
        .unwrap()
        .unwrap();
    let mut seen = tracker.state.data.payments_seen.clone();
    seen.sort();
    assert_eq!(seen, vec!["ord-1", "ord-2"]);
}

#[tokio::test]
async fn unsubscribed_events_are_not_delivered() {
    let store = MemoryStore::new();
    let orders = repo::<OrderWorkflow>(&store);
    let trackers = repo::<TrackerWorkflow>(&store);

    trackers
        .create_new(
            &WorkflowId::new("trk-1"),
            &TrackerCommand::Init {
                source: "ord-1".to_owned(),
            },
            vec![],
        )
        .await
        .unwrap();
    // A different order pays; the tracker is not subscribed to it.
    orders
        .create_new(&WorkflowId::new("ord-9"), &place(1.0), vec![])
        .await
        .unwrap();
    orders
        .process_command(&WorkflowId::new("ord-9"), &OrderCommand::Pay {
            payment_id: "p".to_owned(),
        })
        .await
        .unwrap();

    let mut runner = tracker_runner(&store);
    runner.run_until_idle().await.unwrap();

    let tracker = trackers
        .load_state(&WorkflowId::new("trk-1"), None)
        .await
        .unwrap()
        .unwrap();
    assert!(tracker.state.data.payments_seen.is_empty());
}

#[tokio::test]
async fn runner_commits_its_scan_horizon() {
    let store = MemoryStore::new();
    let orders = repo::<OrderWorkflow>(&store);
    orders
        .create_new(&WorkflowId::new("ord-1"), &place(10.0), vec![])
        .await
        .unwrap();
    orders
        .process_command(&WorkflowId::new("ord-1"), &OrderCommand::Ship)
        .await
        .unwrap();

    let mut runner = tracker_runner(&store);
    runner.run_until_idle().await.unwrap();

    let offset = runner.reader().current_offset().await.unwrap();
    let head = runner.reader().max_observed().await.unwrap();
    assert_eq!(offset, head);
    assert_eq!(head, 2);
}

#[tokio::test]
async fn partitioned_runner_only_acts_on_its_own_workflows() {
    let store = MemoryStore::new();
    let orders = repo::<OrderWorkflow>(&store);

    // Find two order ids landing on different partitions of 2.
    let ids = ["ord-1", "ord-2", "ord-3", "ord-4", "ord-5"];
    let mine = ids
        .iter()
        .copied()
        .find(|id| partition_index(id, 2) == 0)
        .unwrap()
        .to_string();
    let theirs = ids
        .iter()
        .copied()
        .find(|id| partition_index(id, 2) == 1)
        .unwrap()
        .to_string();

    for id in [&mine, &theirs] {
        orders
            .create_new(&WorkflowId::new(id.clone()), &place(1.0), vec![])
            .await
            .unwrap();
    }

    let partition = PartitionedRunnerConfig::new(OrderWorkflow::TYPE, 0, 2).unwrap();
    let repo = repo::<OrderWorkflow>(&store);
    let adapter = crate::support::workflows::FlakyAdapter::failing(0);
    let attempts = adapter.attempts.clone();
    let executor = ActionExecutor::new(store.clone(), repo.clone(), adapter);
    let scheduler = DelayScheduler::new(store.clone(), repo.clone());
    let mut runner = WorkflowRunner::for_partition(
        store.clone(),
        repo,
        executor.clone(),
        scheduler,
        &test_config(),
        &partition,
    );
    runner.run_until_idle().await.unwrap();
    executor.drain(std::time::Duration::from_secs(1)).await;

    // Only the partition-0 order triggered the adapter.
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(
        store
            .activity(&WorkflowId::new(mine), 1)
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        store
            .activity(&WorkflowId::new(theirs), 1)
            .await
            .unwrap()
            .is_none()
    );
}
