//! Contact channel integration tests.
//!
//! These tests exercise the full inbound path: raw bytes on a channel,
//! registry upsert, result correlation and instruction delivery.

use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use sortie::contact::{
    BeaconResponse, ChannelRegistry, ContactService, ForwardedChannel, TcpTransport,
};
use sortie::core::{LinkId, LinkStatus};
use sortie::orchestration::{EngineContext, OperationConfig, Scheduler};
use sortie::payload::LocalPayloadStore;
use sortie::state::MemoryStore;
use sortie::Error;

use crate::fixtures::{engine, eventually, paw};

const A1_BEACON: &str = r#"{"paw":"A1","platform":"linux","executors":["sh"],"host":"web01"}"#;

struct Harness {
    ctx: EngineContext,
    scheduler: Arc<Scheduler>,
    service: Arc<ContactService>,
    dir: TempDir,
}

fn harness_with(channels: ChannelRegistry) -> Harness {
    let ctx = engine();
    let dir = TempDir::new().unwrap();
    let scheduler = Arc::new(Scheduler::new(ctx.clone(), Arc::new(MemoryStore::new())));
    let payloads = Arc::new(LocalPayloadStore::new(
        dir.path().join("payloads"),
        dir.path().join("exfil"),
    ));
    let service = Arc::new(ContactService::new(
        ctx.registry.clone(),
        scheduler.clone(),
        payloads,
        channels,
    ));
    Harness {
        ctx,
        scheduler,
        service,
        dir,
    }
}

fn harness() -> Harness {
    harness_with(ChannelRegistry::with_builtins())
}

fn beacon_with_result(link_id: LinkId, exit_code: i32, output: &str) -> String {
    serde_json::json!({
        "paw": "A1",
        "platform": "linux",
        "executors": ["sh"],
        "results": [{ "link_id": link_id, "exit_code": exit_code, "output": output }],
    })
    .to_string()
}

/// Test: Beacon round trip
/// Given an agent polling over the beacon channel
/// When it joins, is trusted, collects its link and reports the result
/// Then the registry, the chain and the replies reflect each step
#[tokio::test]
async fn test_beacon_end_to_end() {
    let h = harness();

    let reply = h.service.handle_beacon("beacon", A1_BEACON).await.unwrap();
    let reply: BeaconResponse = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply.paw, paw("A1"));
    assert!(reply.instructions.is_empty());
    let agent = h.ctx.registry.lookup(&paw("A1")).await.unwrap();
    assert!(!agent.trusted, "beacon channel never vouches for an agent");
    assert!(reply.sleep >= agent.sleep_min && reply.sleep <= agent.sleep_max);

    h.ctx.registry.mark_trusted(&paw("A1")).await;
    let op = h
        .scheduler
        .create_operation(OperationConfig::new("beacon", "ping-only", "atomic"))
        .await
        .unwrap();
    assert!(eventually(|| async { !op.links().await.is_empty() }).await);

    let reply = h.service.handle_beacon("beacon", A1_BEACON).await.unwrap();
    let reply: BeaconResponse = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply.instructions.len(), 1);
    assert_eq!(reply.instructions[0].operation_id, op.id());
    let link_id = reply.instructions[0].link_id;

    let raw = beacon_with_result(link_id, 0, "pong");
    let reply = h.service.handle_beacon("beacon", &raw).await.unwrap();
    let reply: BeaconResponse = serde_json::from_str(&reply).unwrap();
    assert!(reply.instructions.is_empty());
    assert_eq!(op.link(&link_id).await.unwrap().status, LinkStatus::Success);

    h.scheduler.shutdown();
}

/// Test: Malformed heartbeat
/// Given a beacon body that is not a profile
/// When it is received
/// Then a decode error is returned and no agent is registered
#[tokio::test]
async fn test_decode_failure_leaves_registry_untouched() {
    let h = harness();
    let err = h.service.handle_beacon("beacon", "{not json").await.unwrap_err();
    assert!(matches!(err, Error::ChannelDecode { .. }));
    assert!(h.ctx.registry.is_empty().await);

    let err = h.service.handle_beacon("smoke-signal", A1_BEACON).await.unwrap_err();
    assert!(matches!(err, Error::UnknownChannel(_)));
}

/// Test: Result for an unknown link
/// Given a heartbeat carrying a result nobody asked for
/// When it is ingested
/// Then the heartbeat still succeeds and the agent is registered
#[tokio::test]
async fn test_unknown_result_is_isolated() {
    let h = harness();
    let raw = beacon_with_result(LinkId::new(), 0, "surprise");
    let reply = h.service.handle_beacon("beacon", &raw).await.unwrap();
    let reply: BeaconResponse = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply.paw, paw("A1"));
    assert!(h.ctx.registry.lookup(&paw("A1")).await.is_some());
}

/// Test: Forwarded beacons
/// Given a forwarded channel configured to vouch for its peer
/// When a relayed key=value beacon arrives
/// Then the agent is registered trusted and the reply is key=value encoded
#[tokio::test]
async fn test_forwarded_channel_trusts_relayed_agents() {
    let mut channels = ChannelRegistry::with_builtins();
    channels.register(Arc::new(ForwardedChannel::new(true)));
    let h = harness_with(channels);

    let reply = h
        .service
        .handle_beacon("forwarded", "paw=F1;platform=linux;executors=sh,bash;user=svc")
        .await
        .unwrap();
    assert!(reply.starts_with("paw=F1;sleep="));
    assert!(reply.ends_with("instructions=W10="));

    let agent = h.ctx.registry.lookup(&paw("F1")).await.unwrap();
    assert!(agent.trusted);
    assert_eq!(agent.contact, "forwarded");
    assert_eq!(agent.username, "svc");
    assert_eq!(agent.executors, vec!["sh", "bash"]);
}

/// Test: TCP transport
/// Given a listener on an ephemeral loopback port
/// When a client sends a beacon line and then a malformed line
/// Then it gets one JSON reply and one ERR line
#[tokio::test]
async fn test_tcp_round_trip() {
    let h = harness();
    let transport = TcpTransport::bind("127.0.0.1:0", h.service.clone())
        .await
        .unwrap();
    let addr = transport.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(transport.serve(cancel.clone()));

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write
        .write_all(format!("beacon {}\n", A1_BEACON).as_bytes())
        .await
        .unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    let reply: BeaconResponse = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply.paw, paw("A1"));

    write.write_all(b"garbage\n").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert!(reply.starts_with("ERR "));

    cancel.cancel();
    server.await.unwrap();
    assert_eq!(h.ctx.registry.len().await, 1);
}

/// Test: Oversized frame
/// Given a listener with a 64 byte frame limit
/// When a client sends a longer line
/// Then it gets one ERR line and the connection is closed
#[tokio::test]
async fn test_tcp_rejects_oversized_frame() {
    let h = harness();
    let transport = TcpTransport::bind("127.0.0.1:0", h.service.clone())
        .await
        .unwrap()
        .with_max_frame(64);
    let addr = transport.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(transport.serve(cancel.clone()));

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let line = format!("beacon {}\n", "A".repeat(4096));
    write.write_all(line.as_bytes()).await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert_eq!(reply, "ERR frame exceeds 64 bytes");
    assert!(lines.next_line().await.unwrap().is_none());

    cancel.cancel();
    server.await.unwrap();
    assert_eq!(h.ctx.registry.len().await, 0);
}

/// Test: Payloads and uploads
/// Given platform-specific and generic payloads on disk
/// When a linux agent downloads and uploads
/// Then it gets the linux build and its upload lands under its own paw
#[tokio::test]
async fn test_payload_download_and_upload() {
    let h = harness();
    let payloads = h.dir.path().join("payloads");
    std::fs::create_dir_all(&payloads).unwrap();
    std::fs::write(payloads.join("implant"), b"generic").unwrap();
    std::fs::write(payloads.join("implant-linux"), b"elf").unwrap();
    h.service.handle_beacon("beacon", A1_BEACON).await.unwrap();

    let bytes = h.service.download_payload(&paw("A1"), "implant").await.unwrap();
    assert_eq!(bytes, b"elf");
    let bytes = h.service.download_payload(&paw("nobody"), "implant").await.unwrap();
    assert_eq!(bytes, b"generic");
    assert!(matches!(
        h.service.download_payload(&paw("A1"), "missing").await,
        Err(Error::PayloadNotFound(_))
    ));

    let path = h
        .service
        .upload_artifact(&paw("A1"), "loot.txt", b"secrets".to_vec())
        .await
        .unwrap();
    assert_eq!(path, h.dir.path().join("exfil").join("A1").join("loot.txt"));
    assert_eq!(std::fs::read(&path).unwrap(), b"secrets");

    for name in ["../escape", "nested/loot", ""] {
        assert!(matches!(
            h.service.upload_artifact(&paw("A1"), name, b"x".to_vec()).await,
            Err(Error::PathTraversal(_))
        ));
    }
}
