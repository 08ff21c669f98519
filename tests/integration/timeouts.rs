//! Dead-agent timeout integration tests.

use chrono::Utc;
use std::time::Duration;

use sortie::core::LinkStatus;
use sortie::orchestration::{Operation, OperationConfig, OperationState, StepOutcome};

use crate::fixtures::{engine, engine_with, enroll, paw, settings};

/// Test: Uncollected link times out
/// Given a link whose agent never polls
/// When the dead-agent window has passed
/// Then the link is TIMEOUT and the operation still reaches FINISHED
#[tokio::test]
async fn test_uncollected_link_times_out() {
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(OperationConfig::new("quiet", "ping-only", "atomic"), ctx)
        .await
        .unwrap();
    op.step().await.unwrap();

    assert_eq!(op.expire_links(Utc::now()).await, 0);
    let later = Utc::now() + chrono::Duration::seconds(61);
    assert_eq!(op.expire_links(later).await, 1);
    assert_eq!(op.links().await[0].status, LinkStatus::Timeout);

    assert_eq!(op.step().await.unwrap(), StepOutcome::Finished);
    assert_eq!(op.state().await, OperationState::Finished);
}

/// Test: Timeout inside the decision loop
/// Given a zero dead-agent window
/// When the next iteration runs
/// Then the queued link is timed out in that iteration and the operation
/// finishes without re-deciding it
#[tokio::test]
async fn test_decision_loop_expires_links() {
    let ctx = engine_with(sortie::orchestration::EngineSettings {
        dead_agent_window: Duration::ZERO,
        ..settings()
    });
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(OperationConfig::new("zero", "ping-only", "atomic"), ctx)
        .await
        .unwrap();

    assert_eq!(op.step().await.unwrap(), StepOutcome::Decided(1));
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(op.step().await.unwrap(), StepOutcome::Finished);

    let links = op.links().await;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].status, LinkStatus::Timeout);
    assert!(op.collect_for(&paw("A1"), Utc::now()).await.is_empty());
}

/// Test: Collected link gets its run time
/// Given a collected link with a 60s executor timeout
/// When only the dead-agent window has passed
/// Then the link is still running; after timeout plus window it expires
#[tokio::test]
async fn test_collected_link_deadline_includes_timeout() {
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(OperationConfig::new("slow", "ping-only", "atomic"), ctx)
        .await
        .unwrap();
    op.step().await.unwrap();
    let collected_at = Utc::now();
    op.collect_for(&paw("A1"), collected_at).await;

    assert_eq!(
        op.expire_links(collected_at + chrono::Duration::seconds(90)).await,
        0
    );
    assert_eq!(
        op.expire_links(collected_at + chrono::Duration::seconds(121)).await,
        1
    );
}
