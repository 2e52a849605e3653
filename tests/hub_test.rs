//! Connection hub behavior: fan-out, echo suppression, device takeover,
//! and the bounded outbound queue.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use syncbridge::hub::{self, ConnectionIdentity, HubHandle, OutboundFrame};
use syncbridge::protocol::{Message, MessageType, OUTBOUND_QUEUE_SIZE};

fn identity(user_id: &str, device_id: &str) -> ConnectionIdentity {
    ConnectionIdentity {
        user_id: user_id.to_string(),
        session_id: "session-1".to_string(),
        device_id: device_id.to_string(),
        device_type: "phone".to_string(),
        device_name: "test device".to_string(),
        is_admin: false,
    }
}

async fn recv_frame(rx: &mut mpsc::Receiver<OutboundFrame>) -> Message {
    let frame = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("outbound queue closed");
    serde_json::from_str(&frame).expect("frame should be valid JSON")
}

async fn wait_for(hub: &HubHandle, check: impl Fn(&syncbridge::hub::HubSnapshot) -> bool) {
    for _ in 0..200 {
        if check(&hub.snapshot()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("hub never reached expected state: {:?}", hub.snapshot());
}

fn broadcast_to(user_id: &str, exclude_connection: &str) -> Message {
    let mut message = Message::build(
        MessageType::StateUpdate,
        json!({
            "key": "x",
            "value": 1,
            "exclude_connection": exclude_connection,
        }),
    );
    message.user_id = user_id.to_string();
    message
}

#[tokio::test]
async fn fan_out_suppresses_sender_echo() {
    let hub = hub::spawn();

    let (tx1, mut rx1) = hub::outbound_channel();
    let (tx2, mut rx2) = hub::outbound_channel();
    hub.register("conn-1".into(), tx1);
    hub.register("conn-2".into(), tx2);
    hub.authenticate("conn-1".into(), identity("user-1", "device-1"));
    hub.authenticate("conn-2".into(), identity("user-1", "device-2"));
    wait_for(&hub, |s| s.authenticated == 2).await;

    // conn-1 sees conn-2 join.
    let joined = recv_frame(&mut rx1).await;
    assert_eq!(joined.message_type(), Some(MessageType::DeviceJoined));
    assert_eq!(joined.device_id, "device-2");

    hub.broadcast(broadcast_to("user-1", "conn-1"));

    let update = recv_frame(&mut rx2).await;
    assert_eq!(update.message_type(), Some(MessageType::StateUpdate));
    assert_eq!(update.payload_str("key"), Some("x"));

    // The excluded sender got nothing beyond the join notice.
    wait_for(&hub, |s| s.messages_received == 1).await;
    assert!(rx1.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_reaches_every_sibling_without_exclusion() {
    let hub = hub::spawn();

    let (tx1, mut rx1) = hub::outbound_channel();
    let (tx2, mut rx2) = hub::outbound_channel();
    hub.register("conn-1".into(), tx1);
    hub.register("conn-2".into(), tx2);
    hub.authenticate("conn-1".into(), identity("user-1", "device-1"));
    hub.authenticate("conn-2".into(), identity("user-1", "device-2"));
    wait_for(&hub, |s| s.authenticated == 2).await;
    let _ = recv_frame(&mut rx1).await; // DeviceJoined for conn-2

    hub.broadcast(broadcast_to("user-1", ""));

    assert_eq!(
        recv_frame(&mut rx1).await.message_type(),
        Some(MessageType::StateUpdate)
    );
    assert_eq!(
        recv_frame(&mut rx2).await.message_type(),
        Some(MessageType::StateUpdate)
    );
}

#[tokio::test]
async fn broadcast_is_scoped_to_the_user() {
    let hub = hub::spawn();

    let (tx1, _rx1) = hub::outbound_channel();
    let (tx2, mut rx2) = hub::outbound_channel();
    hub.register("conn-1".into(), tx1);
    hub.register("conn-2".into(), tx2);
    hub.authenticate("conn-1".into(), identity("user-1", "device-1"));
    hub.authenticate("conn-2".into(), identity("user-2", "device-2"));
    wait_for(&hub, |s| s.authenticated == 2).await;

    hub.broadcast(broadcast_to("user-1", ""));
    wait_for(&hub, |s| s.messages_received == 1).await;

    assert!(rx2.try_recv().is_err());
}

#[tokio::test]
async fn full_outbound_queue_drops_frames_for_that_recipient_only() {
    let hub = hub::spawn();

    let (tx1, mut rx1) = hub::outbound_channel();
    hub.register("conn-1".into(), tx1);
    hub.authenticate("conn-1".into(), identity("user-1", "device-1"));
    wait_for(&hub, |s| s.authenticated == 1).await;

    let total = OUTBOUND_QUEUE_SIZE + 44;
    for _ in 0..total {
        hub.broadcast(broadcast_to("user-1", ""));
    }
    wait_for(&hub, |s| s.messages_received == total as i64).await;

    // Exactly the queue capacity was enqueued; the overflow was dropped.
    let mut delivered = 0;
    while rx1.try_recv().is_ok() {
        delivered += 1;
    }
    assert_eq!(delivered, OUTBOUND_QUEUE_SIZE);
    assert_eq!(hub.snapshot().messages_sent, OUTBOUND_QUEUE_SIZE as i64);
}

#[tokio::test]
async fn device_takeover_disconnects_previous_holder() {
    let hub = hub::spawn();

    let (tx1, mut rx1) = hub::outbound_channel();
    let (tx2, _rx2) = hub::outbound_channel();
    hub.register("conn-1".into(), tx1);
    hub.authenticate("conn-1".into(), identity("user-1", "device-1"));
    wait_for(&hub, |s| s.authenticated == 1).await;

    hub.register("conn-2".into(), tx2);
    hub.authenticate("conn-2".into(), identity("user-1", "device-1"));
    wait_for(&hub, |s| s.total == 1).await;

    // The old connection's queue closed once the hub dropped it.
    loop {
        match timeout(Duration::from_secs(1), rx1.recv()).await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => panic!("old connection queue never closed"),
        }
    }

    let snapshot = hub.snapshot();
    assert_eq!(snapshot.authenticated, 1);
    assert_eq!(
        snapshot.online_devices.get("device-1").map(String::as_str),
        Some("conn-2")
    );
}

#[tokio::test]
async fn unregister_notifies_remaining_devices() {
    let hub = hub::spawn();

    let (tx1, mut rx1) = hub::outbound_channel();
    let (tx2, _rx2) = hub::outbound_channel();
    hub.register("conn-1".into(), tx1);
    hub.register("conn-2".into(), tx2);
    hub.authenticate("conn-1".into(), identity("user-1", "device-1"));
    hub.authenticate("conn-2".into(), identity("user-1", "device-2"));
    wait_for(&hub, |s| s.authenticated == 2).await;
    let _ = recv_frame(&mut rx1).await; // DeviceJoined for conn-2

    hub.unregister("conn-2".into());
    wait_for(&hub, |s| s.total == 1).await;

    let left = recv_frame(&mut rx1).await;
    assert_eq!(left.message_type(), Some(MessageType::DeviceLeft));
    assert_eq!(left.device_id, "device-2");
    assert!(!hub.is_device_online("device-2"));
}

#[tokio::test]
async fn peak_tracks_the_high_water_mark() {
    let hub = hub::spawn();

    let (tx1, _rx1) = hub::outbound_channel();
    let (tx2, _rx2) = hub::outbound_channel();
    hub.register("conn-1".into(), tx1);
    hub.register("conn-2".into(), tx2);
    wait_for(&hub, |s| s.total == 2).await;

    hub.unregister("conn-1".into());
    wait_for(&hub, |s| s.total == 1).await;

    let snapshot = hub.snapshot();
    assert_eq!(snapshot.peak, 2);
}

#[tokio::test]
async fn admin_broadcast_targets_admin_connections_only() {
    let hub = hub::spawn();

    let (tx1, mut rx1) = hub::outbound_channel();
    let (tx2, mut rx2) = hub::outbound_channel();
    hub.register("conn-1".into(), tx1);
    hub.register("conn-2".into(), tx2);
    let mut admin = identity("user-1", "device-1");
    admin.is_admin = true;
    hub.authenticate("conn-1".into(), admin);
    hub.authenticate("conn-2".into(), identity("user-2", "device-2"));
    wait_for(&hub, |s| s.authenticated == 2).await;

    hub.admin_broadcast(Message::build(
        MessageType::AdminUpdate,
        json!({"message": "maintenance at midnight"}),
    ));

    let update = recv_frame(&mut rx1).await;
    assert_eq!(update.message_type(), Some(MessageType::AdminUpdate));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx2.try_recv().is_err());
}
