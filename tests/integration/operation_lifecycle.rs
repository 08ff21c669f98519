//! Operation lifecycle integration tests.
//!
//! These tests drive an operation step by step and play the agent side by
//! hand: collecting queued links and reporting results.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use sortie::core::{Fact, FactStore, InMemoryFactStore, LinkStatus, OperationId, Platform};
use sortie::orchestration::{
    Operation, OperationConfig, OperationEvent, OperationState, StepOutcome,
};

use crate::fixtures::{engine, enroll, enroll_as, paw, profile, success};

/// Test: Single ping link lifecycle
/// Given trusted linux agent A1 offering sh and the ping-only adversary
/// When the operation decides, A1 collects and reports exit code 0
/// Then the chain holds exactly one SUCCESS link and nothing is re-decided
#[tokio::test]
async fn test_single_link_lifecycle() {
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(OperationConfig::new("ping", "ping-only", "atomic"), ctx)
        .await
        .unwrap();

    assert_eq!(op.step().await.unwrap(), StepOutcome::Decided(1));
    let links = op.links().await;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].status, LinkStatus::Execute);
    assert_eq!(links[0].command, "ping -c 1 localhost");

    let instructions = op.collect_for(&paw("A1"), Utc::now()).await;
    assert_eq!(instructions.len(), 1);
    assert!(op.link(&instructions[0].link_id).await.unwrap().is_collected());

    let status = op
        .report_result(&paw("A1"), &success(instructions[0].link_id, "pong"), Utc::now())
        .await
        .unwrap();
    assert_eq!(status, LinkStatus::Success);

    // Planner has nothing new; the operation closes.
    assert_eq!(op.step().await.unwrap(), StepOutcome::Finished);
    let links = op.links().await;
    assert_eq!(links.len(), 1, "ping must not be decided twice");
    assert_eq!(links[0].status, LinkStatus::Success);
    assert_eq!(links[0].output.as_deref(), Some("pong"));
}

/// Test: Empty planner
/// Given a planner that never proposes anything
/// When the operation runs one iteration
/// Then it is FINISHED with zero links
#[tokio::test]
async fn test_empty_planner_finishes_in_one_iteration() {
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(OperationConfig::new("noop", "ping-only", "empty"), ctx)
        .await
        .unwrap();

    assert_eq!(op.step().await.unwrap(), StepOutcome::Finished);
    assert_eq!(op.state().await, OperationState::Finished);
    assert!(op.finished_at().await.is_some());
    assert!(op.links().await.is_empty());
}

/// Test: At-most-once collection
/// Given one queued link for A1
/// When two polls for A1 race
/// Then exactly one of them receives the link
#[tokio::test]
async fn test_concurrent_collection_delivers_once() {
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(OperationConfig::new("race", "ping-only", "atomic"), ctx)
        .await
        .unwrap();
    op.step().await.unwrap();

    let a1 = paw("A1");
    let (first, second) = tokio::join!(
        op.collect_for(&a1, Utc::now()),
        op.collect_for(&a1, Utc::now())
    );
    assert_eq!(first.len() + second.len(), 1);
    assert!(op.collect_for(&a1, Utc::now()).await.is_empty());
}

/// Test: Executor matching
/// Given a linux sh agent, a windows psh agent and an adversary with one
/// ability per platform
/// When the batch planner decides
/// Then each agent only gets the ability its executors can run
#[tokio::test]
async fn test_links_respect_agent_executors() {
    let ctx = engine();
    enroll(&ctx, "lin", true).await;
    enroll_as(&ctx, profile("win", Platform::Windows, &["psh"]), true).await;
    let op = Operation::create(OperationConfig::new("mixed", "mixed", "batch"), ctx)
        .await
        .unwrap();

    assert_eq!(op.step().await.unwrap(), StepOutcome::Decided(2));
    let mut pairs: Vec<(String, String, String)> = op
        .links()
        .await
        .into_iter()
        .map(|l| (l.paw.to_string(), l.ability_id, l.executor))
        .collect();
    pairs.sort();
    assert_eq!(
        pairs,
        vec![
            ("lin".to_string(), "ping".to_string(), "sh".to_string()),
            ("win".to_string(), "win-procs".to_string(), "psh".to_string()),
        ]
    );
}

/// Test: Pause keeps queued work deliverable
/// Given a queued link and a paused operation
/// When the agent polls and reports
/// Then the link is still delivered and concludes, but no new link is decided
#[tokio::test]
async fn test_paused_operation_still_delivers_queued_links() {
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(OperationConfig::new("paused", "recon-chain", "batch").with_source("seed"), ctx)
        .await
        .unwrap();

    // Batch decides whoami and `ls /home/alice` from the seeded fact.
    assert_eq!(op.step().await.unwrap(), StepOutcome::Decided(2));
    op.pause().await.unwrap();
    assert_eq!(op.step().await.unwrap(), StepOutcome::Paused);

    let instructions = op.collect_for(&paw("A1"), Utc::now()).await;
    assert_eq!(instructions.len(), 2);
    let listing = instructions
        .iter()
        .find(|i| i.command == "ls /home/alice")
        .unwrap();
    let status = op
        .report_result(&paw("A1"), &success(listing.link_id, "notes.txt"), Utc::now())
        .await
        .unwrap();
    assert_eq!(status, LinkStatus::Success);

    assert_eq!(op.step().await.unwrap(), StepOutcome::Paused);
    assert_eq!(op.links().await.len(), 2);
}

/// Test: Finish discards undelivered work
/// Given two agents with one queued link each, one of them collected
/// When the operation is stopped
/// Then the uncollected link is DISCARD and the collected one still
/// accepts its late result
#[tokio::test]
async fn test_stop_discards_queued_but_keeps_collected() {
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    enroll(&ctx, "A2", true).await;
    let op = Operation::create(OperationConfig::new("stop", "ping-only", "batch"), ctx)
        .await
        .unwrap();
    assert_eq!(op.step().await.unwrap(), StepOutcome::Decided(2));

    let delivered = op.collect_for(&paw("A1"), Utc::now()).await;
    assert_eq!(delivered.len(), 1);
    op.stop().await.unwrap();
    assert_eq!(op.state().await, OperationState::Finished);

    assert!(op.collect_for(&paw("A2"), Utc::now()).await.is_empty());
    let a2_link = op
        .links()
        .await
        .into_iter()
        .find(|l| l.paw == paw("A2"))
        .unwrap();
    assert_eq!(a2_link.status, LinkStatus::Discard);

    let status = op
        .report_result(&paw("A1"), &success(delivered[0].link_id, "late"), Utc::now())
        .await
        .unwrap();
    assert_eq!(status, LinkStatus::Success);
}

/// Test: Cleanup is held until the operation is done
/// Given a successful whoami link whose executor declares cleanup
/// When the planner runs out of work
/// Then the held cleanup link is released, bound to the agent's paw and
/// delivered after FINISHED
#[tokio::test]
async fn test_cleanup_released_on_exhaustion() {
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(OperationConfig::new("clean", "recon", "atomic"), ctx)
        .await
        .unwrap();
    op.step().await.unwrap();
    let primary = op.collect_for(&paw("A1"), Utc::now()).await;
    op.report_result(&paw("A1"), &success(primary[0].link_id, "root"), Utc::now())
        .await
        .unwrap();

    let cleanup = op
        .links()
        .await
        .into_iter()
        .find(|l| l.cleanup)
        .expect("cleanup link appended");
    assert_eq!(cleanup.status, LinkStatus::Pause);
    assert_eq!(cleanup.paired_link, Some(primary[0].link_id));
    assert!(op.collect_for(&paw("A1"), Utc::now()).await.is_empty());

    assert_eq!(op.step().await.unwrap(), StepOutcome::Finished);
    assert!(op.has_outstanding_work().await);

    let released = op.collect_for(&paw("A1"), Utc::now()).await;
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].command, "rm -f /tmp/.A1");
    op.report_result(&paw("A1"), &success(released[0].link_id, ""), Utc::now())
        .await
        .unwrap();
    assert!(!op.has_outstanding_work().await);
}

/// Test: Cleanup for a late result
/// Given a collected whoami link and a stopped operation
/// When the late result arrives
/// Then its cleanup link is immediately deliverable
#[tokio::test]
async fn test_cleanup_after_finish_is_immediately_deliverable() {
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(OperationConfig::new("late", "recon", "atomic"), ctx)
        .await
        .unwrap();
    op.step().await.unwrap();
    let primary = op.collect_for(&paw("A1"), Utc::now()).await;
    op.stop().await.unwrap();

    op.report_result(&paw("A1"), &success(primary[0].link_id, "root"), Utc::now())
        .await
        .unwrap();
    let cleanup = op.collect_for(&paw("A1"), Utc::now()).await;
    assert_eq!(cleanup.len(), 1);
    assert!(cleanup[0].command.starts_with("rm -f"));
}

/// Test: Facts feed later decisions
/// Given recon-chain without a fact source
/// When whoami reports "bob"
/// Then the next decision lists bob's home directory
#[tokio::test]
async fn test_parsed_facts_unlock_next_ability() {
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(OperationConfig::new("chain", "recon-chain", "atomic"), ctx.clone())
        .await
        .unwrap();

    assert_eq!(op.step().await.unwrap(), StepOutcome::Decided(1));
    // list-home needs host.user.name, which nobody knows yet.
    assert_eq!(op.step().await.unwrap(), StepOutcome::Waiting);

    let whoami = op.collect_for(&paw("A1"), Utc::now()).await;
    op.report_result(&paw("A1"), &success(whoami[0].link_id, "bob\n"), Utc::now())
        .await
        .unwrap();
    let facts = ctx.facts.facts_for(op.id()).await.unwrap();
    assert!(facts.iter().any(|f| f.name == "host.user.name" && f.value == "bob"));

    assert_eq!(op.step().await.unwrap(), StepOutcome::Decided(1));
    let listing = op
        .links()
        .await
        .into_iter()
        .find(|l| l.ability_id == "list-home")
        .unwrap();
    assert_eq!(listing.command, "ls /home/bob");
    assert_eq!(listing.used_facts.len(), 1);
}

/// Test: Visibility ceiling
/// Given an ability louder than the operation allows
/// When it is decided
/// Then it is HIGH_VIZ, never delivered, and does not hold the operation open
#[tokio::test]
async fn test_high_visibility_link_is_held_back() {
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(OperationConfig::new("loud", "loud", "atomic"), ctx)
        .await
        .unwrap();

    assert_eq!(op.step().await.unwrap(), StepOutcome::Decided(1));
    assert_eq!(op.links().await[0].status, LinkStatus::HighViz);
    assert!(op.collect_for(&paw("A1"), Utc::now()).await.is_empty());
    assert_eq!(op.step().await.unwrap(), StepOutcome::Finished);
}

/// Test: Raised visibility ceiling
/// Given the same loud ability and an operation visibility of 95
/// When it is decided
/// Then it is an ordinary EXECUTE link
#[tokio::test]
async fn test_visibility_ceiling_is_configurable() {
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(
        OperationConfig::new("loud", "loud", "atomic").with_visibility(95),
        ctx,
    )
    .await
    .unwrap();

    op.step().await.unwrap();
    assert_eq!(op.links().await[0].status, LinkStatus::Execute);
}

/// Test: Group targeting
/// Given agents in the default group and in "blue"
/// When an operation targets "blue"
/// Then only the blue agent gets links
#[tokio::test]
async fn test_group_filter_limits_targets() {
    let ctx = engine();
    enroll(&ctx, "red1", true).await;
    enroll_as(&ctx, profile("blue1", Platform::Linux, &["sh"]).with_group("blue"), true).await;
    let op = Operation::create(
        OperationConfig::new("blue", "ping-only", "batch").with_group("blue"),
        ctx,
    )
    .await
    .unwrap();

    assert_eq!(op.step().await.unwrap(), StepOutcome::Decided(1));
    assert_eq!(op.links().await[0].paw, paw("blue1"));
}

/// Test: Auto-close disabled
/// Given an operation with auto_close off and an empty planner
/// When an iteration finds nothing to do
/// Then the operation stays RUNNING until stopped
#[tokio::test]
async fn test_without_auto_close_operation_stays_open() {
    let ctx = engine();
    let op = Operation::create(
        OperationConfig::new("open", "ping-only", "empty").with_auto_close(false),
        ctx,
    )
    .await
    .unwrap();

    assert_eq!(op.step().await.unwrap(), StepOutcome::Exhausted);
    assert_eq!(op.state().await, OperationState::Running);
    op.stop().await.unwrap();
    assert_eq!(op.step().await.unwrap(), StepOutcome::Finished);
}

/// Test: Chain events
/// Given a subscriber on a fresh operation
/// When a link is decided, collected and concluded
/// Then the subscriber sees those events in order, then the finish
#[tokio::test]
async fn test_events_follow_link_lifecycle() {
    let ctx = engine();
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(OperationConfig::new("events", "ping-only", "atomic"), ctx)
        .await
        .unwrap();
    let mut events = op.subscribe();

    op.step().await.unwrap();
    let delivered = op.collect_for(&paw("A1"), Utc::now()).await;
    op.report_result(&paw("A1"), &success(delivered[0].link_id, ""), Utc::now())
        .await
        .unwrap();
    op.step().await.unwrap();

    assert!(matches!(
        events.recv().await.unwrap(),
        OperationEvent::LinkDecided { status: LinkStatus::Execute, .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        OperationEvent::LinkCollected { .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        OperationEvent::LinkFinished { status: LinkStatus::Success, .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        OperationEvent::StateChanged { to: OperationState::Finished, .. }
    ));
}

/// Fact store whose merges take a while to land.
struct SlowFacts {
    inner: InMemoryFactStore,
    delay: Duration,
}

#[async_trait]
impl FactStore for SlowFacts {
    async fn facts_for(&self, operation: OperationId) -> sortie::Result<Vec<Fact>> {
        self.inner.facts_for(operation).await
    }

    async fn merge(&self, operation: OperationId, facts: Vec<Fact>) -> sortie::Result<usize> {
        tokio::time::sleep(self.delay).await;
        self.inner.merge(operation, facts).await
    }
}

/// Test: Decisions wait for an in-flight result
/// Given recon-chain on the batch planner and a fact store with slow merges
/// When whoami reports "root" and a step starts while the facts are still
/// being merged
/// Then the step sees the parsed fact and decides `ls /home/root` instead
/// of finishing the operation
#[tokio::test]
async fn test_step_waits_for_result_facts() {
    let mut ctx = engine();
    ctx.facts = Arc::new(SlowFacts {
        inner: InMemoryFactStore::new(),
        delay: Duration::from_millis(300),
    });
    enroll(&ctx, "A1", true).await;
    let op = Operation::create(OperationConfig::new("slow", "recon-chain", "batch"), ctx)
        .await
        .unwrap();

    assert_eq!(op.step().await.unwrap(), StepOutcome::Decided(1));
    let whoami = op.collect_for(&paw("A1"), Utc::now()).await;
    assert_eq!(whoami.len(), 1);

    let reporter = op.clone();
    let link_id = whoami[0].link_id;
    let report = tokio::spawn(async move {
        reporter
            .report_result(&paw("A1"), &success(link_id, "root\n"), Utc::now())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(op.step().await.unwrap(), StepOutcome::Decided(1));
    assert_eq!(op.state().await, OperationState::Running);
    assert_eq!(report.await.unwrap().unwrap(), LinkStatus::Success);
    let links = op.links().await;
    let listing = links.iter().find(|l| l.ability_id == "list-home").unwrap();
    assert_eq!(listing.command, "ls /home/root");
    assert!(links.iter().any(|l| l.cleanup));
}
