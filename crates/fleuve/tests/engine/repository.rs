//! Repository behavior: command path, lifecycle, snapshots, concurrency.

use std::sync::Arc;
use std::time::Duration;

use fleuve::store::{EventStore, NewEvent};
use fleuve::{
    Error, EventMetadata, Lifecycle, MemoryStateCache, MemoryStore, Repository, UpcastError,
    Workflow, WorkflowEvent, WorkflowId, WorkflowState,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::support::repo;
use crate::support::workflows::{OrderCommand, OrderState, OrderWorkflow};

fn place() -> OrderCommand {
    OrderCommand::Place {
        items: vec!["a".to_owned(), "b".to_owned()],
        total: 10.0,
    }
}

#[tokio::test]
async fn simple_order_lifecycle() {
    let store = MemoryStore::new();
    let repo = repo::<OrderWorkflow>(&store);
    let wid = WorkflowId::new("ord-1");

    let outcome = repo.create_new(&wid, &place(), vec![]).await.unwrap();
    assert_eq!(outcome.state.version, 1);
    assert_eq!(outcome.state.state.data.status, "new");
    assert_eq!(outcome.state.state.data.total, 10.0);
    assert_eq!(outcome.events.len(), 1);

    let outcome = repo
        .process_command(&wid, &OrderCommand::Pay {
            payment_id: "p".to_owned(),
        })
        .await
        .unwrap();
    assert_eq!(outcome.state.version, 2);
    assert_eq!(outcome.state.state.data.status, "paid");

    let err = repo
        .process_command(&wid, &OrderCommand::Pay {
            payment_id: "p2".to_owned(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Rejected(ref r) if r.msg == "already paid"));

    // State unchanged at v=2.
    let current = repo.current_state(&wid).await.unwrap().unwrap();
    assert_eq!(current.version, 2);
    assert_eq!(current.state.data.status, "paid");
}

#[tokio::test]
async fn create_twice_reports_already_exists() {
    let store = MemoryStore::new();
    let repo = repo::<OrderWorkflow>(&store);
    let wid = WorkflowId::new("ord-1");

    repo.create_new(&wid, &place(), vec![]).await.unwrap();
    let err = repo.create_new(&wid, &place(), vec![]).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));
}

#[tokio::test]
async fn command_on_missing_workflow_reports_not_found() {
    let store = MemoryStore::new();
    let repo = repo::<OrderWorkflow>(&store);
    let err = repo
        .process_command(&WorkflowId::new("ghost"), &OrderCommand::Ship)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn empty_decision_is_a_no_op() {
    let store = MemoryStore::new();
    let repo = repo::<OrderWorkflow>(&store);
    let wid = WorkflowId::new("ord-1");

    repo.create_new(&wid, &place(), vec![]).await.unwrap();
    let outcome = repo
        .process_command(&wid, &OrderCommand::Noop)
        .await
        .unwrap();
    assert_eq!(outcome.state.version, 1);
    assert!(outcome.events.is_empty());
    assert_eq!(store.latest_version(&wid).await.unwrap(), 1);
}

#[tokio::test]
async fn lifecycle_gates_reject_commands() {
    let store = MemoryStore::new();
    let repo = repo::<OrderWorkflow>(&store);
    let wid = WorkflowId::new("ord-1");
    repo.create_new(&wid, &place(), vec![]).await.unwrap();

    repo.pause_workflow(&wid, "maintenance").await.unwrap();
    let err = repo
        .process_command(&wid, &OrderCommand::Ship)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Paused { .. }));

    // Pausing again is a no-op, resume reopens the workflow.
    let outcome = repo.pause_workflow(&wid, "again").await.unwrap();
    assert!(outcome.events.is_empty());
    repo.resume_workflow(&wid).await.unwrap();
    repo.process_command(&wid, &OrderCommand::Ship).await.unwrap();

    repo.cancel_workflow(&wid, "fraud").await.unwrap();
    let err = repo
        .process_command(&wid, &OrderCommand::AddItem { sku: "c".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));
    let err = repo.resume_workflow(&wid).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));

    let state = repo.current_state(&wid).await.unwrap().unwrap();
    assert_eq!(state.state.lifecycle, Lifecycle::Cancelled);
}

#[tokio::test]
async fn concurrent_writers_produce_a_dense_version_sequence() {
    let store = MemoryStore::new();
    let repo = repo::<OrderWorkflow>(&store);
    let wid = WorkflowId::new("ord-1");
    repo.create_new(&wid, &place(), vec![]).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let repo = repo.clone();
        let wid = wid.clone();
        handles.push(tokio::spawn(async move {
            repo.process_command(&wid, &OrderCommand::AddItem {
                sku: format!("sku-{i}"),
            })
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let events = store.events_for_workflow(&wid, None).await.unwrap();
    assert_eq!(events.len(), 21);
    let versions: Vec<i64> = events.iter().map(|e| e.workflow_version).collect();
    assert_eq!(versions, (1..=21).collect::<Vec<i64>>());
    assert_eq!(store.latest_version(&wid).await.unwrap(), 21);
}

#[tokio::test]
async fn exactly_one_concurrent_payment_wins() {
    let store = MemoryStore::new();
    let repo = repo::<OrderWorkflow>(&store);
    let wid = WorkflowId::new("ord-2");
    repo.create_new(&wid, &place(), vec![]).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..2 {
        let repo = repo.clone();
        let wid = wid.clone();
        handles.push(tokio::spawn(async move {
            repo.process_command(&wid, &OrderCommand::Pay {
                payment_id: format!("p{i}"),
            })
            .await
        }));
    }
    let mut successes = 0;
    let mut rejections = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(Error::Rejected(r)) => {
                assert_eq!(r.msg, "already paid");
                rejections += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(rejections, 1);
    assert_eq!(store.latest_version(&wid).await.unwrap(), 2);
}

#[tokio::test]
async fn snapshot_roundtrip_and_time_travel() {
    let store = MemoryStore::new();
    let repo = repo::<OrderWorkflow>(&store).with_snapshot_interval(2);
    let wid = WorkflowId::new("ord-1");

    repo.create_new(&wid, &place(), vec![]).await.unwrap();
    for i in 0..4 {
        repo.process_command(&wid, &OrderCommand::AddItem {
            sku: format!("sku-{i}"),
        })
        .await
        .unwrap();
    }

    // A snapshot exists at an interval boundary.
    let snapshot = store.latest_snapshot(&wid, None).await.unwrap().unwrap();
    assert_eq!(snapshot.version % 2, 0);

    // Snapshot-assisted load equals full replay.
    let loaded = repo.load_state(&wid, None).await.unwrap().unwrap();
    assert_eq!(loaded.version, 5);
    assert_eq!(loaded.state.data.items.len(), 6);

    // Historical versions materialize with replay semantics.
    let at_two = repo.load_state(&wid, Some(2)).await.unwrap().unwrap();
    assert_eq!(at_two.version, 2);
    assert_eq!(at_two.state.data.items.len(), 3);

    let at_one = repo.load_state(&wid, Some(1)).await.unwrap().unwrap();
    assert_eq!(at_one.state.data.items, vec!["a", "b"]);
}

#[tokio::test]
async fn final_event_finishes_the_workflow() {
    let store = MemoryStore::new();
    let repo = repo::<OrderWorkflow>(&store);
    let wid = WorkflowId::new("ord-1");

    repo.create_new(&wid, &place(), vec![]).await.unwrap();
    repo.process_command(&wid, &OrderCommand::Archive)
        .await
        .unwrap();

    let err = repo
        .process_command(&wid, &OrderCommand::Ship)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert!(repo.load_state(&wid, None).await.unwrap().is_none());
    // Time travel into the finished history still works.
    let at_one = repo.load_state(&wid, Some(1)).await.unwrap().unwrap();
    assert_eq!(at_one.state.data.status, "new");
}

#[tokio::test]
async fn workflow_tags_are_injected_into_event_metadata() {
    let store = MemoryStore::new();
    let repo = repo::<OrderWorkflow>(&store);
    let wid = WorkflowId::new("ord-1");

    repo.create_new(&wid, &place(), vec!["eu".to_owned(), "vip".to_owned()])
        .await
        .unwrap();
    repo.process_command(&wid, &OrderCommand::Ship).await.unwrap();

    let events = store.events_for_workflow(&wid, None).await.unwrap();
    assert_eq!(events.len(), 2);
    for event in &events {
        assert_eq!(event.metadata.workflow_tags, vec!["eu", "vip"]);
    }
    assert_eq!(
        store.workflow_tags(&wid).await.unwrap(),
        vec!["eu", "vip"]
    );
}

// =============================================================================
// Schema upcasting
// =============================================================================

struct LedgerWorkflow;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerState {
    amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum LedgerCommand {
    Book { amount: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum LedgerEvent {
    Booked { amount: i64 },
}

impl Workflow for LedgerWorkflow {
    type State = LedgerState;
    type Command = LedgerCommand;
    type Event = LedgerEvent;

    const TYPE: &'static str = "ledger";
    const SCHEMA_VERSION: i32 = 2;

    fn decide(
        _state: Option<&WorkflowState<LedgerState>>,
        cmd: &LedgerCommand,
    ) -> Result<Vec<WorkflowEvent<LedgerEvent>>, fleuve::Rejection> {
        let LedgerCommand::Book { amount } = cmd;
        Ok(vec![LedgerEvent::Booked { amount: *amount }.into()])
    }

    fn evolve(mut state: LedgerState, event: &LedgerEvent) -> LedgerState {
        let LedgerEvent::Booked { amount } = event;
        state.amount += amount;
        state
    }

    fn event_to_cmd(_event: &fleuve::ConsumedEvent) -> Option<LedgerCommand> {
        None
    }

    // Version 1 recorded cents under `amount_cents`; version 2 stores whole
    // units under `amount`.
    fn upcast(
        event_type: &str,
        schema_version: i32,
        mut body: Value,
    ) -> Result<Value, UpcastError> {
        if event_type == "Booked" && schema_version == 1 {
            let cents = body
                .get("amount_cents")
                .and_then(Value::as_i64)
                .ok_or_else(|| UpcastError::new("missing amount_cents"))?;
            let object = body
                .as_object_mut()
                .ok_or_else(|| UpcastError::new("event body is not an object"))?;
            object.remove("amount_cents");
            object.insert("amount".to_owned(), Value::from(cents / 100));
        }
        Ok(body)
    }
}

async fn seed_v1_event(store: &MemoryStore, wid: &WorkflowId, body: Value) {
    let mut uow = store.begin("ledger", wid).await.unwrap();
    let base = uow.current_version().await.unwrap();
    uow.append_events(base, vec![NewEvent {
        event_type: "Booked".to_owned(),
        schema_version: 1,
        body,
        metadata: EventMetadata::default(),
    }])
    .await
    .unwrap();
    uow.commit().await.unwrap();
}

#[tokio::test]
async fn old_schema_events_are_upcast_during_replay() {
    let store = MemoryStore::new();
    let wid = WorkflowId::new("ledger-1");
    seed_v1_event(
        &store,
        &wid,
        serde_json::json!({"type": "Booked", "amount_cents": 250}),
    )
    .await;

    let repo: Repository<LedgerWorkflow, _> =
        Repository::new(store.clone(), Arc::new(MemoryStateCache::new()));
    let loaded = repo.load_state(&wid, None).await.unwrap().unwrap();
    assert_eq!(loaded.state.data.amount, 2);

    // New appends land under the current schema version and replay cleanly
    // alongside the migrated event.
    repo.process_command(&wid, &LedgerCommand::Book { amount: 3 })
        .await
        .unwrap();
    let loaded = repo.load_state(&wid, None).await.unwrap().unwrap();
    assert_eq!(loaded.state.data.amount, 5);
    let events = store.events_for_workflow(&wid, None).await.unwrap();
    assert_eq!(events[0].schema_version, 1);
    assert_eq!(events[1].schema_version, 2);
}

#[tokio::test]
async fn failed_upcast_is_fatal_for_the_workflow() {
    let store = MemoryStore::new();
    let wid = WorkflowId::new("ledger-1");
    seed_v1_event(&store, &wid, serde_json::json!({"type": "Booked"})).await;

    let repo: Repository<LedgerWorkflow, _> =
        Repository::new(store.clone(), Arc::new(MemoryStateCache::new()));
    let err = repo.load_state(&wid, None).await.unwrap_err();
    assert!(matches!(err, Error::SchemaUpcast { .. }));
}

#[tokio::test]
async fn cached_state_is_never_ahead_of_the_store() {
    let store = MemoryStore::new();
    let cache = Arc::new(MemoryStateCache::new());
    let repo: Repository<OrderWorkflow, _> =
        Repository::new(store.clone(), Arc::clone(&cache) as Arc<dyn fleuve::StateCache>);
    let wid = WorkflowId::new("ord-1");

    repo.create_new(&wid, &place(), vec![]).await.unwrap();
    repo.process_command(&wid, &OrderCommand::Ship).await.unwrap();

    let cached = fleuve::StateCache::get(cache.as_ref(), "order:ord-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.version, store.latest_version(&wid).await.unwrap());
    let state: WorkflowState<OrderState> = serde_json::from_value(cached.state).unwrap();
    assert_eq!(state.data.status, "shipped");
}

#[tokio::test]
async fn command_processing_survives_cache_eviction() {
    let store = MemoryStore::new();
    let cache = Arc::new(MemoryStateCache::new());
    let repo: Repository<OrderWorkflow, _> =
        Repository::new(store.clone(), Arc::clone(&cache) as Arc<dyn fleuve::StateCache>);
    let wid = WorkflowId::new("ord-1");

    repo.create_new(&wid, &place(), vec![]).await.unwrap();
    fleuve::StateCache::delete(cache.as_ref(), "order:ord-1")
        .await
        .unwrap();

    // Reload goes through snapshot + replay and repopulates the cache.
    let outcome = repo
        .process_command(&wid, &OrderCommand::Ship)
        .await
        .unwrap();
    assert_eq!(outcome.state.version, 2);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(
        fleuve::StateCache::get(cache.as_ref(), "order:ord-1")
            .await
            .unwrap()
            .is_some()
    );
}
