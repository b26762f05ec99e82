//! Full engine assembly: runner + executor + scheduler under one shutdown.

use std::sync::Arc;
use std::time::Duration;

use fleuve::{MemoryStateCache, MemoryStore, WorkflowEngine, WorkflowId};

use crate::support::workflows::{BillingAdapter, OrderCommand, OrderWorkflow};
use crate::support::{test_config, wait_until};

#[tokio::test]
async fn engine_processes_commands_and_effects_until_shutdown() {
    let store = MemoryStore::new();
    let engine = WorkflowEngine::<OrderWorkflow, _, _>::new(
        store.clone(),
        Arc::new(MemoryStateCache::new()),
        BillingAdapter,
        test_config(),
    )
    .with_shutdown_timeout(Duration::from_secs(2));
    let repo = engine.repository().clone();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let engine_handle = tokio::spawn(engine.run(async move {
        let _ = shutdown_rx.await;
    }));

    // A placed order flows through the runner to the billing adapter, whose
    // yielded Pay command lands back on the workflow.
    let wid = WorkflowId::new("ord-1");
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

    wait_until(Duration::from_secs(5), || {
        let repo = repo.clone();
        let wid = wid.clone();
        async move {
            matches!(
                repo.current_state(&wid).await.unwrap(),
                Some(state) if state.state.data.status == "paid"
            )
        }
    })
    .await;

    let _ = shutdown_tx.send(());
    let result = tokio::time::timeout(Duration::from_secs(10), engine_handle)
        .await
        .expect("engine did not shut down")
        .unwrap();
    result.unwrap();

    // Exactly one payment despite at-least-once delivery.
    let state = repo.current_state(&wid).await.unwrap().unwrap();
    assert_eq!(state.state.data.payments, 1);
}
