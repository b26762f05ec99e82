//! Activity executor: retries, checkpoints, timeouts, dead-letter flow.

use std::sync::atomic::Ordering;
use std::time::Duration;

use fleuve::store::{ActivityStatus, ActivityStore, EventStore};
use fleuve::{ActionExecutor, ConsumedEvent, MemoryStore, RetryPolicy, WorkflowId};

use crate::support::workflows::{
    BillingAdapter, CheckpointAdapter, FlakyAdapter, OrderCommand, OrderWorkflow, SlowAdapter,
};
use crate::support::{repo, wait_until};

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        factor: 2.0,
        min: Duration::from_millis(10),
        max: Duration::from_millis(100),
        jitter: 0.0,
        ..RetryPolicy::default()
    }
}

async fn placed_event(store: &MemoryStore, wid: &str) -> ConsumedEvent {
    let repo = repo::<OrderWorkflow>(store);
    repo.create_new(
        &WorkflowId::new(wid),
        &OrderCommand::Place {
            items: vec!["a".to_owned()],
            total: 10.0,
        },
        vec![],
    )
    .await
    .unwrap();
    let record = store
        .event_by_version(&WorkflowId::new(wid), 1)
        .await
        .unwrap()
        .unwrap();
    ConsumedEvent::from_record(record, Some("test-runner".to_owned()))
}

#[tokio::test]
async fn retry_until_success_records_attempts() {
    let store = MemoryStore::new();
    let event = placed_event(&store, "ord-1").await;
    let adapter = FlakyAdapter::failing(2);
    let attempts = adapter.attempts.clone();
    let successes = adapter.successes.clone();

    let executor = ActionExecutor::new(store.clone(), repo::<OrderWorkflow>(&store), adapter)
        .with_retry_policy(fast_policy(3));
    executor.execute_action(event).await.unwrap();

    let wid = WorkflowId::new("ord-1");
    wait_until(Duration::from_secs(2), || {
        let store = store.clone();
        let wid = wid.clone();
        async move {
            matches!(
                store.activity(&wid, 1).await.unwrap(),
                Some(a) if a.status == ActivityStatus::Completed
            )
        }
    })
    .await;

    let activity = store.activity(&wid, 1).await.unwrap().unwrap();
    assert_eq!(activity.status, ActivityStatus::Completed);
    assert_eq!(activity.retry_count, 2);
    assert!(activity.finished_at.is_some());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // Exactly one success.
    assert_eq!(successes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_the_activity() {
    let store = MemoryStore::new();
    let event = placed_event(&store, "ord-1").await;
    let adapter = FlakyAdapter::failing(u32::MAX);
    let attempts = adapter.attempts.clone();
    let dead_letters = adapter.dead_letters.clone();

    let executor = ActionExecutor::new(store.clone(), repo::<OrderWorkflow>(&store), adapter)
        .with_retry_policy(fast_policy(1));
    executor.execute_action(event).await.unwrap();

    let wid = WorkflowId::new("ord-1");
    wait_until(Duration::from_secs(2), || {
        let store = store.clone();
        let wid = wid.clone();
        async move {
            matches!(
                store.activity(&wid, 1).await.unwrap(),
                Some(a) if a.status == ActivityStatus::Failed
            )
        }
    })
    .await;

    // max_retries + 1 attempts, then dead letter.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(dead_letters.load(Ordering::SeqCst), 1);
    let activity = store.activity(&wid, 1).await.unwrap().unwrap();
    assert!(activity.error_message.unwrap().contains("transient failure"));
}

#[tokio::test]
async fn dead_letter_can_be_retried_manually() {
    let store = MemoryStore::new();
    let event = placed_event(&store, "ord-1").await;
    let adapter = FlakyAdapter::failing(1);
    let successes = adapter.successes.clone();

    // First run fails its single allowed attempt and dead-letters.
    let executor = ActionExecutor::new(store.clone(), repo::<OrderWorkflow>(&store), adapter)
        .with_retry_policy(fast_policy(0));
    executor.execute_action(event).await.unwrap();

    let wid = WorkflowId::new("ord-1");
    wait_until(Duration::from_secs(2), || {
        let store = store.clone();
        let wid = wid.clone();
        async move {
            matches!(
                store.activity(&wid, 1).await.unwrap(),
                Some(a) if a.status == ActivityStatus::Failed
            )
        }
    })
    .await;

    // Operator retry: resets the record and re-runs; the adapter now
    // succeeds (it only failed the first attempt).
    assert!(executor.retry_failed_action(&wid, 1).await.unwrap());
    wait_until(Duration::from_secs(2), || {
        let store = store.clone();
        let wid = wid.clone();
        async move {
            matches!(
                store.activity(&wid, 1).await.unwrap(),
                Some(a) if a.status == ActivityStatus::Completed
            )
        }
    })
    .await;
    assert_eq!(successes.load(Ordering::SeqCst), 1);

    // Retrying a non-failed activity reports false.
    assert!(!executor.retry_failed_action(&wid, 1).await.unwrap());
}

#[tokio::test]
async fn completed_activities_are_not_rerun() {
    let store = MemoryStore::new();
    let event = placed_event(&store, "ord-1").await;
    let adapter = FlakyAdapter::failing(0);
    let attempts = adapter.attempts.clone();

    let executor = ActionExecutor::new(store.clone(), repo::<OrderWorkflow>(&store), adapter)
        .with_retry_policy(fast_policy(0));
    executor.execute_action(event.clone()).await.unwrap();
    executor.drain(Duration::from_secs(1)).await;

    // At-least-once delivery re-offers the event; the record blocks it.
    executor.execute_action(event).await.unwrap();
    executor.drain(Duration::from_secs(1)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn yielded_commands_apply_and_are_idempotent_on_redelivery() {
    let store = MemoryStore::new();
    let event = placed_event(&store, "ord-1").await;
    let repo = repo::<OrderWorkflow>(&store);

    let executor = ActionExecutor::new(store.clone(), repo.clone(), BillingAdapter)
        .with_retry_policy(fast_policy(0));
    executor.execute_action(event.clone()).await.unwrap();
    executor.drain(Duration::from_secs(1)).await;

    let wid = WorkflowId::new("ord-1");
    let state = repo.current_state(&wid).await.unwrap().unwrap();
    assert_eq!(state.state.data.status, "paid");
    assert_eq!(state.version, 2);

    // Re-run after a simulated partial failure: the yielded Pay is rejected
    // by decide ("already paid") and the activity still completes.
    store
        .mark_activity_failed(&wid, 1, "Simulated", "lost runner")
        .await
        .unwrap();
    let executor = ActionExecutor::new(store.clone(), repo.clone(), BillingAdapter)
        .with_retry_policy(fast_policy(0));
    assert!(executor.retry_failed_action(&wid, 1).await.unwrap());
    wait_until(Duration::from_secs(2), || {
        let store = store.clone();
        let wid = wid.clone();
        async move {
            matches!(
                store.activity(&wid, 1).await.unwrap(),
                Some(a) if a.status == ActivityStatus::Completed
            )
        }
    })
    .await;

    let state = repo.current_state(&wid).await.unwrap().unwrap();
    // Still exactly one payment.
    assert_eq!(state.state.data.payments, 1);
    assert_eq!(state.version, 2);
}

#[tokio::test]
async fn checkpoint_skips_completed_steps_on_retry() {
    let store = MemoryStore::new();
    let event = placed_event(&store, "ord-1").await;
    let adapter = CheckpointAdapter::crashing_once();
    let step_one_runs = adapter.step_one_runs.clone();

    let executor = ActionExecutor::new(store.clone(), repo::<OrderWorkflow>(&store), adapter)
        .with_retry_policy(fast_policy(2));
    executor.execute_action(event).await.unwrap();

    let wid = WorkflowId::new("ord-1");
    wait_until(Duration::from_secs(2), || {
        let store = store.clone();
        let wid = wid.clone();
        async move {
            matches!(
                store.activity(&wid, 1).await.unwrap(),
                Some(a) if a.status == ActivityStatus::Completed
            )
        }
    })
    .await;

    // The expensive first step ran once; the retry resumed from the
    // persisted checkpoint.
    assert_eq!(step_one_runs.load(Ordering::SeqCst), 1);
    let activity = store.activity(&wid, 1).await.unwrap().unwrap();
    assert_eq!(activity.retry_count, 1);
    assert_eq!(activity.checkpoint.get("step1"), Some(&serde_json::json!(true)));
}

#[tokio::test]
async fn yielded_timeout_bounds_the_remainder() {
    let store = MemoryStore::new();
    let event = placed_event(&store, "ord-1").await;

    let executor = ActionExecutor::new(store.clone(), repo::<OrderWorkflow>(&store), SlowAdapter)
        .with_retry_policy(fast_policy(0));
    executor.execute_action(event).await.unwrap();

    let wid = WorkflowId::new("ord-1");
    wait_until(Duration::from_secs(3), || {
        let store = store.clone();
        let wid = wid.clone();
        async move {
            matches!(
                store.activity(&wid, 1).await.unwrap(),
                Some(a) if a.status == ActivityStatus::Failed
            )
        }
    })
    .await;

    let activity = store.activity(&wid, 1).await.unwrap().unwrap();
    assert!(activity.error_message.unwrap().contains("timed out"));
}

#[tokio::test]
async fn stale_running_records_are_taken_over() {
    let store = MemoryStore::new();
    let event = placed_event(&store, "ord-1").await;
    let wid = WorkflowId::new("ord-1");

    // A record left in `running` by a dead runner, with no recent attempt.
    let adapter = FlakyAdapter::failing(0);
    let successes = adapter.successes.clone();
    let executor = ActionExecutor::new(store.clone(), repo::<OrderWorkflow>(&store), adapter)
        .with_retry_policy(fast_policy(1));
    let record = fleuve::store::ActivityRecord {
        status: ActivityStatus::Running,
        runner_id: Some("dead-runner".to_owned()),
        ..fleuve::store::ActivityRecord::pending(
            wid.clone(),
            event.event_no,
            fast_policy(1),
            None,
            time::OffsetDateTime::now_utc() - time::Duration::minutes(30),
        )
    };
    store.create_activity_if_absent(record).await.unwrap();
    store
        .update_activity_status(&wid, 1, ActivityStatus::Running, 0, Some("dead-runner"))
        .await
        .unwrap();
    // Age the attempt far past the staleness threshold.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let executor = executor.with_config(&fleuve::EngineConfig {
        activity_stale_after: Duration::from_millis(10),
        ..fleuve::EngineConfig::default()
    });
    let recovered = executor.recover_interrupted_actions().await.unwrap();
    assert_eq!(recovered, 1);

    wait_until(Duration::from_secs(2), || {
        let store = store.clone();
        let wid = wid.clone();
        async move {
            matches!(
                store.activity(&wid, 1).await.unwrap(),
                Some(a) if a.status == ActivityStatus::Completed
            )
        }
    })
    .await;
    assert_eq!(successes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn action_cancel_marks_records_cancelled() {
    let store = MemoryStore::new();
    let _event = placed_event(&store, "ord-1").await;
    let wid = WorkflowId::new("ord-1");

    store
        .create_activity_if_absent(fleuve::store::ActivityRecord::pending(
            wid.clone(),
            1,
            fast_policy(0),
            None,
            time::OffsetDateTime::now_utc(),
        ))
        .await
        .unwrap();

    let executor = ActionExecutor::new(
        store.clone(),
        repo::<OrderWorkflow>(&store),
        FlakyAdapter::failing(0),
    );
    executor.cancel_workflow_actions(&wid, None).await.unwrap();

    let activity = store.activity(&wid, 1).await.unwrap().unwrap();
    assert_eq!(activity.status, ActivityStatus::Cancelled);
}

#[tokio::test]
async fn failed_attempts_emit_structured_warnings() {
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct BufferWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl std::io::Write for BufferWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let writer_buffer = Arc::clone(&buffer);
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || BufferWriter {
            buffer: Arc::clone(&writer_buffer),
        })
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let store = MemoryStore::new();
    let event = placed_event(&store, "ord-1").await;
    let adapter = FlakyAdapter::failing(u32::MAX);
    let executor = ActionExecutor::new(store.clone(), repo::<OrderWorkflow>(&store), adapter)
        .with_retry_policy(fast_policy(0));
    executor.execute_action(event).await.unwrap();
    executor.drain(Duration::from_secs(2)).await;

    let locked = buffer.lock().unwrap();
    let output = String::from_utf8_lossy(&locked);
    assert!(output.contains("Action attempt failed"));
    assert!(output.contains("transient failure"));
}

#[tokio::test]
async fn backoff_delays_follow_the_policy() {
    // Attempts for S4-style parameters: failures at t0 and t0+d0, success
    // at t0+d0+d1 with d0 = min, d1 = min*factor.
    let policy = fast_policy(3);
    assert_eq!(policy.delay_for_retry(0), Duration::from_millis(10));
    assert_eq!(policy.delay_for_retry(1), Duration::from_millis(20));

    let store = MemoryStore::new();
    let event = placed_event(&store, "ord-1").await;
    let adapter = FlakyAdapter::failing(2);
    let attempts = adapter.attempts.clone();

    let start = tokio::time::Instant::now();
    let executor = ActionExecutor::new(store.clone(), repo::<OrderWorkflow>(&store), adapter)
        .with_retry_policy(policy);
    executor.execute_action(event).await.unwrap();
    executor.drain(Duration::from_secs(2)).await;

    let elapsed = start.elapsed();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // Two backoffs: 10ms + 20ms minimum.
    assert!(elapsed >= Duration::from_millis(30), "elapsed {elapsed:?}");
}
