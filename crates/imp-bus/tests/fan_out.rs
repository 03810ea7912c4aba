use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use imp_bus::{BusClient, Headers, InMemoryBus, Subscriber, SubscriberConfig};

const TEXT_BINDING: &str = "im_provider.outbound.*.send.text.v1";

fn instance_queue(instance: &str) -> SubscriberConfig {
    SubscriberConfig::fan_out(
        format!("im-providers.outbound-processor.v1.{instance}.SEND_TEXT_V1"),
        "im_message.events",
        TEXT_BINDING,
    )
}

#[tokio::test]
async fn every_instance_receives_its_own_copy() {
    let bus = InMemoryBus::new();
    let mut node_a = bus.subscribe(&instance_queue("node-a")).await.unwrap();
    let mut node_b = bus.subscribe(&instance_queue("node-b")).await.unwrap();

    bus.publish(
        "im_provider.outbound.5.send.text.v1",
        Headers::new(),
        Bytes::from_static(b"{\"message_id\":\"m\"}"),
    )
    .await
    .unwrap();
    bus.publish(
        "im_provider.outbound.5.send.image.v1",
        Headers::new(),
        Bytes::from_static(b"{}"),
    )
    .await
    .unwrap();

    let a = tokio::time::timeout(Duration::from_secs(1), node_a.next())
        .await
        .unwrap()
        .unwrap();
    let b = tokio::time::timeout(Duration::from_secs(1), node_b.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.payload, b.payload);
    assert_eq!(a.header("routing_key"), Some("im_provider.outbound.5.send.text.v1"));

    // the image command matches neither binding
    assert!(
        tokio::time::timeout(Duration::from_millis(50), node_a.next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn shared_queue_consumers_compete() {
    let bus = InMemoryBus::new();
    let mut shared = instance_queue("shared");
    shared.exclusive_queue = false;
    shared.exclusive_consumer = false;
    let mut first = bus.subscribe(&shared).await.unwrap();
    let mut second = bus.subscribe(&shared).await.unwrap();

    for _ in 0..2 {
        bus.publish(
            "im_provider.outbound.5.send.text.v1",
            Headers::new(),
            Bytes::from_static(b"{}"),
        )
        .await
        .unwrap();
    }

    let one = tokio::time::timeout(Duration::from_secs(1), first.next()).await;
    let two = tokio::time::timeout(Duration::from_secs(1), second.next()).await;
    assert!(one.unwrap().is_some());
    assert!(two.unwrap().is_some());
    assert!(
        tokio::time::timeout(Duration::from_millis(50), first.next())
            .await
            .is_err()
    );
}
