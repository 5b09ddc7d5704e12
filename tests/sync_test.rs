mod helpers;

use std::time::Duration;

use std::sync::Arc;

use helpers::{axis, record, start_node, start_node_with, test_config, wait_attached, wait_until};
use mnemosync::db;
use mnemosync::memory::engine::FACT_ORIGIN;
use mnemosync::protocol::{
    encode_frame, Body, Envelope, FactBody, ResponseBody, ResponseStatus, ENVELOPE_VERSION,
};
use mnemosync::registry::{CapabilityHandler, InboundTask};
use mnemosync::sync::{Advance, ConnectionState, Delivery};
use mnemosync::transport::{InboundFrame, MemoryHub, Transport};
use mnemosync::Node;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

async fn record_count(node: &Node) -> u64 {
    node.store().stats().await.unwrap().total_records
}

/// Answer every task on `rx` with one partial and one final response.
fn spawn_echo(mut rx: mpsc::Receiver<InboundTask>) {
    tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            task.responder.partial(serde_json::json!({ "progress": 0.5 })).unwrap();
            task.responder.finish(serde_json::json!({ "echo": task.input })).unwrap();
        }
    });
}

async fn fact_frame(sender: &str, content: &str, link_id: &str) -> InboundFrame {
    let envelope = Envelope::new(
        sender,
        None,
        Body::Fact(FactBody {
            content: content.into(),
            link_id: link_id.into(),
            source_record_id: None,
        }),
    );
    InboundFrame {
        transport: "primary".into(),
        bytes: encode_frame(&envelope, 1024 * 1024).unwrap(),
    }
}

/// Frame `envelope` without the checks `encode_frame` applies.
fn raw_frame(envelope: &Envelope) -> InboundFrame {
    let body = rmp_serde::to_vec_named(envelope).unwrap();
    let mut bytes = Vec::with_capacity(body.len() + 9);
    bytes.extend_from_slice(&((body.len() + 5) as u32).to_be_bytes());
    bytes.push(ENVELOPE_VERSION);
    bytes.extend_from_slice(&body);
    bytes.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
    InboundFrame {
        transport: "primary".into(),
        bytes: bytes.into(),
    }
}

#[tokio::test]
async fn shared_fact_reaches_peer_over_primary() {
    let primary = MemoryHub::new("primary");
    let fallback = MemoryHub::new("fallback");
    let vectors = [("user likes tea", axis(0))];
    let a = start_node("a", &[&primary, &fallback], &vectors).await;
    let b = start_node("b", &[&primary, &fallback], &vectors).await;
    wait_attached(&[&primary, &fallback], 2).await;
    assert!(a.wait_connected(WAIT).await);

    let id = a.ingest("user likes tea", "chat", "s1", None).await.unwrap().id;
    let delivery = a.share(&id).await.unwrap();
    assert_eq!(delivery, Delivery::Sent { transport: "primary".into() });

    assert!(wait_until(WAIT, || async { record_count(&b).await == 1 }).await);
    let hits = b.query("user likes tea", 1, None, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.origin_module_id, FACT_ORIGIN);
    assert_eq!(hits[0].record.source_peer.as_deref(), Some("a"));
    assert!(hits[0].record.verified);
    assert_eq!(fallback.delivered(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn replayed_envelope_is_applied_once() {
    let primary = MemoryHub::new("primary");
    let b = start_node("b", &[&primary], &[]).await;

    let frame = fact_frame("x", "the office closes at six", "s1").await;
    b.handle_frame(frame.clone()).await;
    b.handle_frame(InboundFrame {
        transport: "fallback".into(),
        bytes: frame.bytes.clone(),
    })
    .await;

    assert_eq!(record_count(&b).await, 1);
    let hits = b.query("the office closes at six", 1, None, None).await.unwrap();
    let row = record(b.store(), &hits[0].record.id).unwrap();
    // The query itself counts as one access.
    assert_eq!(row.access_count, 2);

    b.shutdown().await;
}

#[tokio::test]
async fn corrupt_and_self_sent_frames_are_dropped() {
    let primary = MemoryHub::new("primary");
    let b = start_node("b", &[&primary], &[]).await;

    let mut frame = fact_frame("x", "tampered content", "s1").await;
    let mut bytes = frame.bytes.to_vec();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xff;
    frame.bytes = bytes.into();
    b.handle_frame(frame).await;

    b.handle_frame(fact_frame("b", "my own echo", "s1").await).await;

    assert_eq!(record_count(&b).await, 0);
    assert!(b.trust().entry("x").is_none());

    b.shutdown().await;
}

#[tokio::test]
async fn low_trust_fact_waits_for_corroboration() {
    let primary = MemoryHub::new("primary");
    let b = start_node("b", &[&primary], &[]).await;
    b.trust().set_score("a", 0.1).unwrap();

    b.handle_frame(fact_frame("a", "the server room is on floor two", "s1").await)
        .await;
    assert_eq!(record_count(&b).await, 1);
    assert!(b
        .query("the server room is on floor two", 5, None, None)
        .await
        .unwrap()
        .is_empty());

    b.handle_frame(fact_frame("c", "the server room is on floor two", "s1").await)
        .await;
    let hits = b
        .query("the server room is on floor two", 5, None, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].record.verified);

    b.shutdown().await;
}

#[tokio::test]
async fn fact_importance_scales_with_sender_trust() {
    let primary = MemoryHub::new("primary");
    let b = start_node("b", &[&primary], &[]).await;
    b.trust().set_score("trusted", 0.9).unwrap();
    b.trust().set_score("doubtful", 0.4).unwrap();

    b.handle_frame(fact_frame("trusted", "standup moved to ten", "s1").await).await;
    b.handle_frame(fact_frame("doubtful", "standup moved to eleven", "s2").await).await;

    let high = b.query("standup moved to ten", 1, None, None).await.unwrap();
    let low = b.query("standup moved to eleven", 1, None, None).await.unwrap();
    assert!(high[0].record.importance > low[0].record.importance);

    b.shutdown().await;
}

#[tokio::test]
async fn request_falls_back_when_primary_is_down() {
    let primary = MemoryHub::new("primary");
    let fallback = MemoryHub::new("fallback");
    primary.set_online(false);

    let a = start_node("a", &[&primary, &fallback], &[]).await;
    let b = start_node("b", &[&primary, &fallback], &[]).await;
    wait_attached(&[&fallback], 2).await;
    assert!(
        a.connector()
            .wait_for(|s| s == ConnectionState::DegradedFallback, WAIT)
            .await
    );

    let (tx, rx) = mpsc::channel(8);
    spawn_echo(rx);
    b.advertise("echo", "1.0", &[], None, CapabilityHandler::Channel(tx))
        .await
        .unwrap();
    assert!(wait_until(WAIT, || async { !a.discover("echo").is_empty() }).await);

    let handle = a.request("echo", serde_json::json!("ping")).await.unwrap();
    let update = handle.final_response(WAIT).await.unwrap();
    assert_eq!(update.responder, "b");
    assert_eq!(update.response.status, ResponseStatus::Ok);
    assert_eq!(update.response.output, serde_json::json!({ "echo": "ping" }));
    assert_eq!(primary.delivered(), 0);
    assert!(fallback.delivered() > 0);

    primary.set_online(true);
    assert!(
        a.connector()
            .wait_for(|s| s == ConnectionState::ConnectedPrimary, WAIT)
            .await
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn completed_request_raises_provider_trust() {
    let primary = MemoryHub::new("primary");
    let a = start_node("a", &[&primary], &[]).await;
    let b = start_node("b", &[&primary], &[]).await;
    wait_attached(&[&primary], 2).await;

    let (tx, rx) = mpsc::channel(8);
    spawn_echo(rx);
    b.advertise("echo", "1.0", &[], None, CapabilityHandler::Channel(tx))
        .await
        .unwrap();
    assert!(wait_until(WAIT, || async { !a.discover("echo").is_empty() }).await);

    let before = a.trust().get_trust("b");
    a.request("echo", serde_json::json!({ "n": 1 }))
        .await
        .unwrap()
        .final_response(WAIT)
        .await
        .unwrap();
    assert!(wait_until(WAIT, || async { a.trust().get_trust("b") > before }).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn unknown_capability_gets_an_error_response() {
    let primary = MemoryHub::new("primary");
    let a = start_node("a", &[&primary], &[]).await;
    let b = start_node("b", &[&primary], &[]).await;
    wait_attached(&[&primary], 2).await;

    let update = a
        .request_from("b", "does.not.exist", serde_json::Value::Null)
        .await
        .unwrap()
        .final_response(WAIT)
        .await
        .unwrap();
    assert_eq!(update.response.status, ResponseStatus::Error);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn withdrawn_capability_disappears_from_peers() {
    let primary = MemoryHub::new("primary");
    let a = start_node("a", &[&primary], &[]).await;
    let b = start_node("b", &[&primary], &[]).await;
    wait_attached(&[&primary], 2).await;

    let (tx, _rx) = mpsc::channel(1);
    b.advertise("search", "2", &["web".into()], None, CapabilityHandler::Channel(tx))
        .await
        .unwrap();
    assert!(wait_until(WAIT, || async { !a.discover("search").is_empty() }).await);

    b.withdraw("search").await.unwrap();
    assert!(wait_until(WAIT, || async { a.discover("search").is_empty() }).await);
    assert!(b.discover("search").is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn queued_fact_is_flushed_when_primary_returns() {
    let primary = MemoryHub::new("primary");
    let fallback = MemoryHub::new("fallback");
    let a = start_node("a", &[&primary, &fallback], &[]).await;
    let b = start_node("b", &[&primary, &fallback], &[]).await;
    wait_attached(&[&primary, &fallback], 2).await;
    assert!(a.wait_connected(WAIT).await);

    primary.set_online(false);
    fallback.set_online(false);
    let id = a.ingest("badge readers reboot at midnight", "ops", "s1", None).await.unwrap().id;
    assert_eq!(a.share(&id).await.unwrap(), Delivery::Queued);
    assert_eq!(a.connector().status().await.unwrap().outbox_pending, 1);
    assert!(
        a.connector()
            .wait_for(|s| s == ConnectionState::DegradedFallback, WAIT)
            .await
    );

    primary.set_online(true);
    assert!(wait_until(WAIT, || async { record_count(&b).await == 1 }).await);
    assert!(
        wait_until(WAIT, || async {
            a.connector().status().await.unwrap().outbox_pending == 0
        })
        .await
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn contradicted_fact_lowers_source_trust() {
    let primary = MemoryHub::new("primary");
    let b = start_node("b", &[&primary], &[]).await;

    b.handle_frame(fact_frame("a", "the wifi password is hunter2", "s1").await)
        .await;
    let hits = b.query("the wifi password is hunter2", 1, None, None).await.unwrap();
    let before = b.trust().get_trust("a");

    let after = b.report_fact_outcome(&hits[0].record.id, true).await.unwrap();
    assert!(after.unwrap() < before);

    let local = b.ingest("a local note", "chat", "s1", None).await.unwrap().id;
    assert_eq!(b.report_fact_outcome(&local, true).await.unwrap(), None);

    b.shutdown().await;
}

#[tokio::test]
async fn maintenance_prunes_and_reports() {
    let primary = MemoryHub::new("primary");
    let b = start_node("b", &[&primary], &[]).await;
    b.handle_frame(fact_frame("a", "status page lives at /status", "s1").await)
        .await;

    let report = b.run_maintenance().await.unwrap();
    assert_eq!(report.pruned_envelopes, 0);
    assert_eq!(report.expired_tasks, 0);

    let status = b.status().await.unwrap();
    assert_eq!(status.peer_id, "b");
    assert_eq!(status.store.total_records, 1);
    assert!(status.peers.iter().any(|p| p.peer_id == "a"));

    b.shutdown().await;
}

#[tokio::test]
async fn local_advertisement_outlives_its_ttl_through_maintenance() {
    let primary = MemoryHub::new("primary");
    let mut config = test_config("b");
    config.maintenance.interval_secs = 1;
    let transports = |peer: &str| vec![Arc::new(primary.transport(peer)) as Arc<dyn Transport>];
    let a = start_node_with(test_config("a"), transports("a"), &[]).await;
    let b = start_node_with(config, transports("b"), &[]).await;
    wait_attached(&[&primary], 2).await;

    let (tx, _rx) = mpsc::channel(1);
    b.advertise("lookup", "1", &[], Some(Duration::from_secs(2)), CapabilityHandler::Channel(tx))
        .await
        .unwrap();
    assert!(wait_until(WAIT, || async { !a.discover("lookup").is_empty() }).await);

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let report = b.run_maintenance().await.unwrap();
        assert_eq!(report.readvertised, 1);
        assert!(!b.discover("lookup").is_empty());
        a.run_maintenance().await.unwrap();
        assert!(!a.discover("lookup").is_empty());
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn non_finite_trust_hint_frame_is_dropped() {
    let primary = MemoryHub::new("primary");
    let b = start_node("b", &[&primary], &[]).await;

    let mut envelope = Envelope::new(
        "x",
        None,
        Body::Fact(FactBody {
            content: "the lobby opens at seven".into(),
            link_id: "s1".into(),
            source_record_id: None,
        }),
    );
    envelope.trust_hint = Some(f64::NAN);
    b.handle_frame(raw_frame(&envelope)).await;

    assert_eq!(record_count(&b).await, 0);
    assert!(b.trust().entry("x").is_none());

    envelope.trust_hint = Some(0.8);
    b.handle_frame(raw_frame(&envelope)).await;
    assert_eq!(record_count(&b).await, 1);

    b.shutdown().await;
}

#[tokio::test]
async fn busy_handler_is_answered_without_stalling_inbound() {
    let primary = MemoryHub::new("primary");
    let a = start_node("a", &[&primary], &[]).await;
    let b = start_node("b", &[&primary], &[]).await;
    wait_attached(&[&primary], 2).await;

    // Capacity one and never drained.
    let (tx, _rx) = mpsc::channel(1);
    b.advertise("slow", "1", &[], None, CapabilityHandler::Channel(tx))
        .await
        .unwrap();

    let queued = a.request_from("b", "slow", serde_json::json!(1)).await.unwrap();
    let rejected = a.request_from("b", "slow", serde_json::json!(2)).await.unwrap();
    let update = rejected.final_response(WAIT).await.unwrap();
    assert_eq!(update.response.status, ResponseStatus::Error);
    assert!(update.response.output.to_string().contains("busy"));

    b.handle_frame(fact_frame("x", "parking is free after six", "s1").await)
        .await;
    assert_eq!(record_count(&b).await, 1);
    assert!(a.connector().pending().status(&queued.correlation_id).is_some());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn response_from_another_peer_leaves_the_task_open() {
    let primary = MemoryHub::new("primary");
    let a = start_node("a", &[&primary], &[]).await;
    let b = start_node("b", &[&primary], &[]).await;
    wait_attached(&[&primary], 2).await;

    let (tx, _rx) = mpsc::channel(8);
    b.advertise("slow", "1", &[], None, CapabilityHandler::Channel(tx))
        .await
        .unwrap();
    let handle = a.request_from("b", "slow", serde_json::Value::Null).await.unwrap();

    let forged = Envelope::response(
        "x",
        "a",
        handle.correlation_id.clone(),
        1,
        ResponseBody {
            status: ResponseStatus::Ok,
            output: serde_json::json!("done"),
        },
    );
    assert_eq!(a.connector().pending().advance(&forged), Advance::Foreign);

    a.handle_frame(InboundFrame {
        transport: "primary".into(),
        bytes: encode_frame(&forged, 1024 * 1024).unwrap(),
    })
    .await;
    assert!(a.connector().pending().status(&handle.correlation_id).is_some());
    assert_eq!(a.trust().get_trust("x"), 0.5);
    assert_eq!(a.trust().entry("x").map(|e| e.successes), Some(0));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn failed_fact_ingest_accepts_a_redelivery() {
    let primary = MemoryHub::new("primary");
    let b = start_node("b", &[&primary], &[]).await;
    let frame = fact_frame("x", "the loading dock is closed", "s1").await;

    {
        let conn = db::lock(b.store().database()).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER fail_ingest BEFORE INSERT ON records \
             BEGIN SELECT RAISE(ABORT, 'disk hiccup'); END;",
        )
        .unwrap();
    }
    b.handle_frame(frame.clone()).await;
    assert_eq!(record_count(&b).await, 0);

    db::lock(b.store().database())
        .unwrap()
        .execute_batch("DROP TRIGGER fail_ingest;")
        .unwrap();
    b.handle_frame(frame).await;
    assert_eq!(record_count(&b).await, 1);

    b.shutdown().await;
}
