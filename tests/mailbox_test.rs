mod helpers;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use helpers::{start_node_with, test_config, wait_until};
use mnemosync::config::MailboxConfig;
use mnemosync::error::CoreError;
use mnemosync::sync::Delivery;
use mnemosync::transport::{MailboxTransport, MemoryHub, Transport};

const WAIT: Duration = Duration::from_secs(5);

fn mailbox(root: &Path, peer: &str) -> Arc<dyn Transport> {
    Arc::new(MailboxTransport::new(
        MailboxConfig {
            root: root.to_string_lossy().into_owned(),
            poll_interval_ms: 10,
        },
        peer,
    ))
}

#[tokio::test]
async fn fact_travels_through_the_mailbox() {
    let dir = tempfile::tempdir().unwrap();
    let a = start_node_with(test_config("a"), vec![mailbox(dir.path(), "a")], &[]).await;
    let b = start_node_with(test_config("b"), vec![mailbox(dir.path(), "b")], &[]).await;
    assert!(wait_until(WAIT, || async { dir.path().join("b").join("inbox").exists() }).await);

    let id = a
        .ingest("the staging database is read-only on sundays", "ops", "s1", None)
        .await
        .unwrap()
        .id;
    assert_eq!(
        a.share(&id).await.unwrap(),
        Delivery::Sent { transport: "mailbox".into() }
    );

    assert!(
        wait_until(WAIT, || async {
            b.store().stats().await.unwrap().total_records == 1
        })
        .await
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn mailbox_carries_traffic_while_primary_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let primary = MemoryHub::new("primary");
    primary.set_online(false);

    let transports = |peer: &str| -> Vec<Arc<dyn Transport>> {
        vec![Arc::new(primary.transport(peer)), mailbox(dir.path(), peer)]
    };
    let a = start_node_with(test_config("a"), transports("a"), &[]).await;
    let b = start_node_with(test_config("b"), transports("b"), &[]).await;
    assert!(wait_until(WAIT, || async { dir.path().join("b").join("inbox").exists() }).await);

    let id = a.ingest("fire drill on thursday", "ops", "s1", None).await.unwrap().id;
    assert_eq!(
        a.share(&id).await.unwrap(),
        Delivery::Sent { transport: "mailbox".into() }
    );
    assert!(
        wait_until(WAIT, || async {
            b.store().stats().await.unwrap().total_records == 1
        })
        .await
    );
    assert_eq!(primary.delivered(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn recipients_cannot_leave_the_mailbox_root() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("boxes");
    let a = mailbox(&root, "a");

    for recipient in ["../escaped", "..", "a/b", "c\\d", ""] {
        let sent = a.send(Some(recipient), bytes::Bytes::from_static(b"frame")).await;
        assert!(matches!(sent, Err(CoreError::CorruptEnvelope(_))), "{recipient:?} was accepted");
    }
    assert!(!dir.path().join("escaped").exists());
}
