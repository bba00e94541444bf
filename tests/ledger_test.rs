use std::time::Duration;

use clusterline::error::PipelineError;
use clusterline::ledger::{FailOutcome, TaskLedger};
use clusterline::types::{ProductStatus, Stage, TaskStatus};

mod common;
use common::{stored_product, temp_store};

fn timeout_error() -> PipelineError {
    PipelineError::Timeout(Duration::from_secs(30))
}

// =========================================================================
// enqueue
// =========================================================================

#[tokio::test]
async fn enqueue_creates_a_pending_task() {
    let (_dir, store) = temp_store().await;
    let ledger = TaskLedger::new(&store);

    let task = ledger.enqueue("item-1", Stage::Ingest, "run-1").await.unwrap();

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.stage, Stage::Ingest);
    assert_eq!(task.attempt, 0);
    assert_eq!(task.product_external_id, "item-1");
}

#[tokio::test]
async fn enqueue_is_idempotent_while_a_task_is_live() {
    let (_dir, store) = temp_store().await;
    let ledger = TaskLedger::new(&store);

    let first = ledger.enqueue("item-1", Stage::Ingest, "run-1").await.unwrap();
    let second = ledger.enqueue("item-1", Stage::Ingest, "run-2").await.unwrap();
    assert_eq!(first.id, second.id);

    // Still idempotent while in progress
    assert!(ledger.claim(first.id).await.unwrap());
    let third = ledger.enqueue("item-1", Stage::Ingest, "run-3").await.unwrap();
    assert_eq!(first.id, third.id);
}

#[tokio::test]
async fn enqueue_after_terminal_task_creates_a_new_one() {
    let (_dir, store) = temp_store().await;
    stored_product(&store, "item-1", "mk").await;
    let ledger = TaskLedger::new(&store);

    let first = ledger.enqueue("item-1", Stage::Cluster, "run-1").await.unwrap();
    assert!(ledger.claim(first.id).await.unwrap());
    ledger.complete(first.id).await.unwrap();

    let second = ledger.enqueue("item-1", Stage::Cluster, "run-2").await.unwrap();
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn distinct_stages_do_not_collide() {
    let (_dir, store) = temp_store().await;
    let ledger = TaskLedger::new(&store);

    let ingest = ledger.enqueue("item-1", Stage::Ingest, "run-1").await.unwrap();
    let enrich = ledger.enqueue("item-1", Stage::Enrich, "run-1").await.unwrap();
    assert_ne!(ingest.id, enrich.id);
}

// =========================================================================
// claim
// =========================================================================

#[tokio::test]
async fn claim_transitions_pending_to_in_progress() {
    let (_dir, store) = temp_store().await;
    let ledger = TaskLedger::new(&store);

    let task = ledger.enqueue("item-1", Stage::Ingest, "run-1").await.unwrap();
    assert!(ledger.claim(task.id).await.unwrap());
    assert_eq!(ledger.get(task.id).await.unwrap().status, TaskStatus::InProgress);
}

#[tokio::test]
async fn claim_fails_when_not_pending() {
    let (_dir, store) = temp_store().await;
    let ledger = TaskLedger::new(&store);

    let task = ledger.enqueue("item-1", Stage::Ingest, "run-1").await.unwrap();
    assert!(ledger.claim(task.id).await.unwrap());
    // Second claim loses
    assert!(!ledger.claim(task.id).await.unwrap());
}

#[tokio::test]
async fn concurrent_claims_exactly_one_wins() {
    let (_dir, store) = temp_store().await;
    let ledger = TaskLedger::new(&store);
    let task = ledger.enqueue("item-1", Stage::Ingest, "run-1").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        let task_id = task.id;
        handles.push(tokio::spawn(async move { ledger.claim(task_id).await }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one concurrent claim must succeed");
}

// =========================================================================
// complete
// =========================================================================

#[tokio::test]
async fn complete_marks_succeeded_and_enqueues_the_next_stage() {
    let (_dir, store) = temp_store().await;
    stored_product(&store, "item-1", "mk").await;
    let ledger = TaskLedger::new(&store);

    let task = ledger.enqueue("item-1", Stage::Ingest, "run-1").await.unwrap();
    assert!(ledger.claim(task.id).await.unwrap());

    let next = ledger.complete(task.id).await.unwrap().expect("successor envelope");
    assert_eq!(next.stage, Stage::Enrich);
    assert_eq!(next.product_external_id, "item-1");

    assert_eq!(ledger.get(task.id).await.unwrap().status, TaskStatus::Succeeded);
    let successor = ledger
        .find_live("item-1", Stage::Enrich)
        .await
        .unwrap()
        .expect("pending successor task");
    assert_eq!(successor.id, next.task_id);
    assert_eq!(successor.status, TaskStatus::Pending);

    // The product's stage pointer advanced with the same unit of work
    let product = store.get_product("item-1").await.unwrap().unwrap();
    assert_eq!(product.stage, Stage::Enrich);
}

#[tokio::test]
async fn complete_of_final_stage_returns_no_successor() {
    let (_dir, store) = temp_store().await;
    stored_product(&store, "item-1", "mk").await;
    let ledger = TaskLedger::new(&store);

    let task = ledger.enqueue("item-1", Stage::Cluster, "run-1").await.unwrap();
    assert!(ledger.claim(task.id).await.unwrap());
    assert!(ledger.complete(task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn complete_requires_an_in_progress_task() {
    let (_dir, store) = temp_store().await;
    let ledger = TaskLedger::new(&store);

    let task = ledger.enqueue("item-1", Stage::Ingest, "run-1").await.unwrap();
    let err = ledger.complete(task.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn complete_reuses_a_live_successor_instead_of_duplicating() {
    let (_dir, store) = temp_store().await;
    stored_product(&store, "item-1", "mk").await;
    let ledger = TaskLedger::new(&store);

    // A live enrich task already exists (e.g. reconciliation created it)
    let existing = ledger.enqueue("item-1", Stage::Enrich, "run-1").await.unwrap();

    let task = ledger.enqueue("item-1", Stage::Ingest, "run-1").await.unwrap();
    assert!(ledger.claim(task.id).await.unwrap());
    let next = ledger.complete(task.id).await.unwrap().unwrap();
    assert_eq!(next.task_id, existing.id);
}

// =========================================================================
// fail
// =========================================================================

#[tokio::test]
async fn retryable_failure_requeues_with_incremented_attempt() {
    let (_dir, store) = temp_store().await;
    let ledger = TaskLedger::new(&store);

    let task = ledger.enqueue("item-1", Stage::Enrich, "run-1").await.unwrap();
    assert!(ledger.claim(task.id).await.unwrap());

    let outcome = ledger.fail(task.id, &timeout_error(), 3).await.unwrap();
    match outcome {
        FailOutcome::Requeued(requeued) => {
            assert_eq!(requeued.status, TaskStatus::Pending);
            assert_eq!(requeued.attempt, 1);
            assert!(requeued.last_error.unwrap().contains("timed out"));
        }
        other => panic!("expected Requeued, got {:?}", other),
    }
}

#[tokio::test]
async fn exhausted_retries_dead_letter_the_task() {
    let (_dir, store) = temp_store().await;
    stored_product(&store, "item-1", "mk").await;
    let ledger = TaskLedger::new(&store);

    let task = ledger.enqueue("item-1", Stage::Enrich, "run-1").await.unwrap();

    // Three consecutive transient failures with a cap of three
    for round in 1..=3u32 {
        assert!(ledger.claim(task.id).await.unwrap());
        let outcome = ledger.fail(task.id, &timeout_error(), 3).await.unwrap();
        match (round, outcome) {
            (1..=2, FailOutcome::Requeued(t)) => assert_eq!(t.attempt, round),
            (3, FailOutcome::DeadLettered(t)) => {
                assert_eq!(t.status, TaskStatus::DeadLettered);
                assert_eq!(t.attempt, 3);
            }
            (_, other) => panic!("unexpected outcome at round {}: {:?}", round, other),
        }
    }

    // Dead-lettering marks the product failed; it stays at its stage
    let product = store.get_product("item-1").await.unwrap().unwrap();
    assert_eq!(product.status, ProductStatus::Failed);
}

#[tokio::test]
async fn permanent_failure_dead_letters_immediately() {
    let (_dir, store) = temp_store().await;
    stored_product(&store, "item-1", "mk").await;
    let ledger = TaskLedger::new(&store);

    let task = ledger.enqueue("item-1", Stage::Ingest, "run-1").await.unwrap();
    assert!(ledger.claim(task.id).await.unwrap());

    let error = PipelineError::SourceMissing("item-1".to_string());
    let outcome = ledger.fail(task.id, &error, 3).await.unwrap();
    assert!(matches!(outcome, FailOutcome::DeadLettered(_)));
    assert_eq!(
        ledger.get(task.id).await.unwrap().status,
        TaskStatus::DeadLettered
    );
}

#[tokio::test]
async fn fail_requires_an_in_progress_task() {
    let (_dir, store) = temp_store().await;
    let ledger = TaskLedger::new(&store);

    let task = ledger.enqueue("item-1", Stage::Ingest, "run-1").await.unwrap();
    let err = ledger.fail(task.id, &timeout_error(), 3).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));
}

// =========================================================================
// replay
// =========================================================================

#[tokio::test]
async fn replay_resets_a_dead_lettered_task() {
    let (_dir, store) = temp_store().await;
    stored_product(&store, "item-1", "mk").await;
    let ledger = TaskLedger::new(&store);

    let task = ledger.enqueue("item-1", Stage::Enrich, "run-1").await.unwrap();
    assert!(ledger.claim(task.id).await.unwrap());
    let error = PipelineError::SourceMissing("item-1".to_string());
    ledger.fail(task.id, &error, 3).await.unwrap();

    let envelope = ledger.replay(task.id).await.unwrap();
    assert_eq!(envelope.task_id, task.id);
    assert_eq!(envelope.attempt, 0);

    let replayed = ledger.get(task.id).await.unwrap();
    assert_eq!(replayed.status, TaskStatus::Pending);
    assert_eq!(replayed.attempt, 0);
    assert!(replayed.last_error.is_none());

    let product = store.get_product("item-1").await.unwrap().unwrap();
    assert_eq!(product.status, ProductStatus::Active);
}

#[tokio::test]
async fn replay_refuses_non_dead_lettered_tasks() {
    let (_dir, store) = temp_store().await;
    let ledger = TaskLedger::new(&store);

    let task = ledger.enqueue("item-1", Stage::Ingest, "run-1").await.unwrap();
    let err = ledger.replay(task.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn missing_task_is_reported() {
    let (_dir, store) = temp_store().await;
    let ledger = TaskLedger::new(&store);

    let err = ledger.get(999).await.unwrap_err();
    assert!(matches!(err, PipelineError::TaskNotFound(999)));
}
