//! Fleet registry integration tests.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;

use sortie::core::{AgentDefaults, NormalizedProfile, Platform};
use sortie::fleet::{AgentFilter, FleetEvent, FleetRegistry};

use crate::fixtures::{paw, profile};

fn heartbeat(offset_secs: i64) -> NormalizedProfile {
    let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let mut hb = profile("A1", Platform::Linux, &["sh"]);
    hb.seen_at = base + ChronoDuration::seconds(offset_secs);
    hb
}

proptest! {
    /// Test: last_seen is order independent
    /// Given any set of heartbeats for one paw
    /// When they are applied in two different orders
    /// Then both registries end at the latest heartbeat time
    #[test]
    fn prop_last_seen_is_commutative(offsets in proptest::collection::vec(0i64..100_000, 1..20)) {
        let (forward, backward) = tokio_test::block_on(async {
            let forward = FleetRegistry::new(AgentDefaults::default());
            for offset in &offsets {
                forward.upsert(heartbeat(*offset)).await;
            }
            let backward = FleetRegistry::new(AgentDefaults::default());
            for offset in offsets.iter().rev() {
                backward.upsert(heartbeat(*offset)).await;
            }
            (
                forward.lookup(&paw("A1")).await.unwrap().last_seen,
                backward.lookup(&paw("A1")).await.unwrap().last_seen,
            )
        });
        let latest = heartbeat(*offsets.iter().max().unwrap()).seen_at;
        prop_assert_eq!(forward, latest);
        prop_assert_eq!(backward, latest);
    }
}

/// Test: Concurrent heartbeats
/// Given many simultaneous heartbeats for one paw
/// When they race into the registry
/// Then there is one agent and its last_seen is the newest heartbeat
#[tokio::test]
async fn test_concurrent_upserts_converge() {
    let registry = Arc::new(FleetRegistry::new(AgentDefaults::default()));
    let handles: Vec<_> = (0..32)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.upsert(heartbeat(i * 7 % 31)).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(registry.len().await, 1);
    let agent = registry.lookup(&paw("A1")).await.unwrap();
    assert_eq!(agent.last_seen, heartbeat(30).seen_at);
}

/// Test: Enrollment without a paw
/// Given a heartbeat that carries no paw
/// When it is upserted
/// Then the registry assigns a fresh paw and applies defaults
#[tokio::test]
async fn test_new_agent_gets_generated_paw() {
    let registry = FleetRegistry::new(AgentDefaults::default());
    let record = registry
        .upsert(NormalizedProfile::new(Platform::Darwin).with_executors(["zsh"]))
        .await;
    assert!(!record.paw.as_str().is_empty());
    assert_eq!(record.group, "red");
    assert_eq!(record.platform, Platform::Darwin);
    assert!(registry.lookup(&record.paw).await.is_some());
}

/// Test: Trust is idempotent
/// Given an untrusted agent
/// When it is marked trusted twice
/// Then exactly one trust event is emitted and a later untrusting
/// heartbeat does not revoke trust
#[tokio::test]
async fn test_mark_trusted_is_idempotent() {
    let registry = FleetRegistry::new(AgentDefaults::default());
    registry.upsert(heartbeat(0)).await;
    let mut events = registry.subscribe();

    assert!(registry.mark_trusted(&paw("A1")).await.unwrap().trusted);
    assert!(registry.mark_trusted(&paw("A1")).await.unwrap().trusted);
    assert!(registry.mark_trusted(&paw("ghost")).await.is_none());

    let mut trusted_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, FleetEvent::AgentTrusted(_)) {
            trusted_events += 1;
        }
    }
    assert_eq!(trusted_events, 1);

    registry.upsert(heartbeat(10)).await;
    let trusted = registry.list(&AgentFilter::default().trusted(true)).await;
    assert_eq!(trusted.len(), 1);
}
