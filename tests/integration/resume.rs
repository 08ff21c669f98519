//! Persistence and restart integration tests.

use std::sync::Arc;
use tempfile::TempDir;

use sortie::core::LinkStatus;
use sortie::orchestration::{OperationConfig, OperationState, Scheduler};
use sortie::state::{JsonFileStore, OperationStore};

use crate::fixtures::{engine, enroll, eventually, paw, success};

/// Test: Restart mid-operation
/// Given an operation whose only link was collected before shutdown
/// When a new scheduler resumes from the same state directory
/// Then the chain is intact and the late result is accepted
#[tokio::test]
async fn test_resume_accepts_late_result() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonFileStore::new(dir.path().join("operations")));

    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let first = Arc::new(Scheduler::new(ctx, store.clone()));
    let runner = tokio::spawn(first.clone().run());
    let op = first
        .create_operation(OperationConfig::new("resumable", "ping-only", "atomic"))
        .await
        .unwrap();
    let id = op.id();

    assert!(eventually(|| async { !op.links().await.is_empty() }).await);
    let delivered = first.fetch_pending(&paw("A1")).await;
    assert_eq!(delivered.len(), 1);
    first.shutdown();
    runner.await.unwrap();

    // Fresh process: empty registry, agent checks in again.
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let second = Arc::new(Scheduler::new(ctx, store.clone()));
    assert_eq!(second.resume_stored().await.unwrap(), 1);

    let restored = second.operation(id).await.unwrap();
    let links = restored.links().await;
    assert_eq!(links.len(), 1);
    assert!(links[0].is_collected());

    let status = second
        .report_result(&paw("A1"), &success(delivered[0].link_id, "pong"))
        .await
        .unwrap();
    assert_eq!(status, LinkStatus::Success);

    assert!(
        eventually(|| async {
            store
                .load_all()
                .await
                .unwrap()
                .iter()
                .any(|r| r.id == id && r.state == OperationState::Finished)
        })
        .await,
        "finished state should be persisted"
    );
    second.shutdown();

    let third = Scheduler::new(engine(), store);
    assert_eq!(third.resume_stored().await.unwrap(), 0);
}

/// Test: Empty state directory
/// Given a state directory that does not exist yet
/// When the scheduler resumes
/// Then nothing is resumed and no error is raised
#[tokio::test]
async fn test_resume_from_missing_directory() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonFileStore::new(dir.path().join("never-created")));
    let scheduler = Scheduler::new(engine(), store);
    assert_eq!(scheduler.resume_stored().await.unwrap(), 0);
}
