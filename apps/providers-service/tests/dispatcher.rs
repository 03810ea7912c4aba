use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use imp_bus::{AckOutcome, BusClient, BusError, Headers, InMemoryBus, Published, Settlement};
use imp_core::Operation;
use imp_provider_registry::testkit::{RecordingProvider, Script, SendCall};
use imp_provider_registry::{ProviderBuilder, ProviderRegistry};
use imp_providers_service::{
    BusFailureSink, DispatchSettings, Dispatcher, DispatcherHandle, FailureSink, PanicPolicy,
    TerminalFailure,
};
use serde_json::{Value, json};
use tracing::Span;
use uuid::Uuid;

const EXCHANGE: &str = "im_message.events";
const MSG_ID: &str = "11111111-1111-1111-1111-111111111111";

struct Node {
    provider: Arc<RecordingProvider>,
    handle: DispatcherHandle,
}

fn fast_settings() -> DispatchSettings {
    DispatchSettings {
        max_retries: 3,
        retry_interval: Duration::from_millis(5),
        handler_timeout: Duration::from_secs(5),
        panic_policy: PanicPolicy::DropOnPanic,
    }
}

async fn start_node(bus: &InMemoryBus, instance: &str, settings: DispatchSettings) -> Node {
    let sink = Arc::new(BusFailureSink::new(Arc::new(bus.clone()), Span::none()));
    start_node_with_sink(bus, instance, settings, sink).await
}

async fn start_node_with_sink(
    bus: &InMemoryBus,
    instance: &str,
    settings: DispatchSettings,
    sink: Arc<dyn FailureSink>,
) -> Node {
    let provider = Arc::new(RecordingProvider::new("whatsapp"));
    let registry =
        Arc::new(ProviderRegistry::new([ProviderBuilder::full(provider.clone())]).unwrap());
    let dispatcher = Dispatcher::new(registry, settings, sink, Span::current());
    let handle = dispatcher.start(bus, EXCHANGE, instance).await.unwrap();
    Node { provider, handle }
}

fn command() -> Value {
    json!({
        "message_id": MSG_ID,
        "thread_id": "22222222-2222-2222-2222-222222222222",
        "domain_id": 5,
        "from": {"id": "33333333-3333-3333-3333-333333333333", "type": 1},
        "to": {"id": "44444444-4444-4444-4444-444444444444", "type": 1},
        "body": "hi",
        "occurred_at": "2024-01-01T00:00:00Z",
        "images": [{"file_id": 7, "mime": "image/png", "name": "a.png", "url": "https://cdn/a.png"}],
        "documents": null
    })
}

/// Publishes on the `5` routing key while the metadata names the provider.
async fn publish(bus: &InMemoryBus, operation: Operation, provider: &str, payload: &[u8]) {
    let mut headers = Headers::new();
    headers.insert("x-routing-key".into(), operation.routing_key(provider));
    bus.publish(
        &operation.routing_key("5"),
        headers,
        Bytes::copy_from_slice(payload),
    )
    .await
    .unwrap();
}

async fn publish_command(bus: &InMemoryBus, operation: Operation) {
    let payload = serde_json::to_vec(&command()).unwrap();
    publish(bus, operation, "whatsapp", &payload).await;
}

async fn settled(bus: &InMemoryBus, count: usize) -> Vec<Settlement> {
    tokio::time::timeout(Duration::from_secs(5), bus.wait_settled(count))
        .await
        .expect("deliveries settled in time")
}

async fn dead_letters(bus: &InMemoryBus) -> Vec<Published> {
    bus.take_published()
        .await
        .into_iter()
        .filter(|published| published.subject.starts_with("dlq."))
        .collect()
}

#[tokio::test]
async fn text_command_reaches_the_provider_named_in_metadata() {
    let bus = InMemoryBus::new();
    let node = start_node(&bus, "node-a", fast_settings()).await;

    publish_command(&bus, Operation::SendText).await;

    let settlements = settled(&bus, 1).await;
    assert_eq!(settlements[0].outcome, AckOutcome::Ack);
    assert_eq!(
        settlements[0].queue,
        "im-providers.outbound-processor.v1.node-a.SEND_TEXT_V1"
    );
    let sends = node.provider.sends();
    assert_eq!(sends.len(), 1);
    let (call, message) = &sends[0];
    assert_eq!(*call, SendCall::Text);
    assert_eq!(message.id, Uuid::parse_str(MSG_ID).unwrap());
    assert_eq!(message.domain_id, 5);
    assert_eq!(message.text, "hi");
    assert_eq!(message.created_at, 1_704_067_200_000);
    assert_eq!(message.images.len(), 1);
    assert_eq!(message.images[0].id, "7");
    assert_eq!(message.images[0].file_name, "a.png");
    assert!(message.documents.is_empty());
    assert!(dead_letters(&bus).await.is_empty());
}

#[tokio::test]
async fn operations_are_routed_to_their_own_pipelines() {
    let bus = InMemoryBus::new();
    let node = start_node(&bus, "node-a", fast_settings()).await;
    assert_eq!(node.handle.queues().len(), 3);
    assert_eq!(bus.active_queues().await.len(), 3);

    publish_command(&bus, Operation::SendImage).await;
    publish_command(&bus, Operation::SendDocument).await;

    let settlements = settled(&bus, 2).await;
    let mut queues: Vec<_> = settlements.iter().map(|s| s.queue.as_str()).collect();
    queues.sort();
    assert!(queues[0].ends_with(".SEND_DOCUMENT_V1"));
    assert!(queues[1].ends_with(".SEND_IMAGE_V1"));

    let mut calls: Vec<_> = node.provider.sends().into_iter().map(|(call, _)| call).collect();
    calls.sort_by_key(|call| format!("{call:?}"));
    assert_eq!(calls, vec![SendCall::Document, SendCall::Image]);
}

#[tokio::test]
async fn every_instance_handles_each_command() {
    let bus = InMemoryBus::new();
    let a = start_node(&bus, "node-a", fast_settings()).await;
    let b = start_node(&bus, "node-b", fast_settings()).await;

    publish_command(&bus, Operation::SendText).await;

    let settlements = settled(&bus, 2).await;
    assert!(settlements.iter().all(|s| s.outcome == AckOutcome::Ack));
    assert_eq!(a.provider.sends().len(), 1);
    assert_eq!(b.provider.sends().len(), 1);
}

#[tokio::test]
async fn undeliverable_commands_are_acked_and_dropped() {
    let bus = InMemoryBus::new();
    let node = start_node(&bus, "node-a", fast_settings()).await;

    publish(&bus, Operation::SendText, "whatsapp", b"not json").await;
    let mut invalid = command();
    invalid["domain_id"] = json!(0);
    publish(
        &bus,
        Operation::SendText,
        "whatsapp",
        &serde_json::to_vec(&invalid).unwrap(),
    )
    .await;
    publish(
        &bus,
        Operation::SendText,
        "viber",
        &serde_json::to_vec(&command()).unwrap(),
    )
    .await;

    let settlements = settled(&bus, 3).await;
    assert!(settlements.iter().all(|s| s.outcome == AckOutcome::Ack));
    assert!(node.provider.sends().is_empty());
    assert!(dead_letters(&bus).await.is_empty());
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let bus = InMemoryBus::new();
    let node = start_node(&bus, "node-a", fast_settings()).await;
    node.provider.script([
        Script::Fail { retryable: true },
        Script::Fail { retryable: true },
    ]);

    publish_command(&bus, Operation::SendText).await;

    let settlements = settled(&bus, 1).await;
    assert_eq!(settlements[0].outcome, AckOutcome::Ack);
    assert_eq!(node.provider.sends().len(), 3);
    assert!(dead_letters(&bus).await.is_empty());
}

#[tokio::test]
async fn exhausted_retries_are_dead_lettered() {
    let bus = InMemoryBus::new();
    let node = start_node(&bus, "node-a", fast_settings()).await;
    node.provider
        .script(std::iter::repeat_n(Script::Fail { retryable: true }, 4));

    publish_command(&bus, Operation::SendText).await;

    let settlements = settled(&bus, 1).await;
    assert_eq!(settlements[0].outcome, AckOutcome::Ack);
    assert_eq!(node.provider.sends().len(), 4);

    let letters = dead_letters(&bus).await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].subject, "dlq.im_provider.text");
    let record = letters[0].json().unwrap();
    assert_eq!(record["operation"], "SEND_TEXT_V1");
    assert_eq!(record["provider"], "whatsapp");
    assert_eq!(
        record["routing_key"],
        "im_provider.outbound.whatsapp.send.text.v1"
    );
    assert_eq!(record["attempts"], 4);
    assert_eq!(record["error"]["code"], "platform_unavailable");
    assert_eq!(record["envelope"]["message_id"], MSG_ID);
}

#[tokio::test]
async fn rejected_commands_use_the_full_retry_budget() {
    let bus = InMemoryBus::new();
    let node = start_node(&bus, "node-a", fast_settings()).await;
    node.provider
        .script(std::iter::repeat_n(Script::Fail { retryable: false }, 4));

    publish_command(&bus, Operation::SendDocument).await;

    settled(&bus, 1).await;
    assert_eq!(node.provider.sends().len(), 4);
    let letters = dead_letters(&bus).await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].subject, "dlq.im_provider.document");
    let record = letters[0].json().unwrap();
    assert_eq!(record["attempts"], 4);
    assert_eq!(record["error"]["code"], "platform_rejected");
}

#[tokio::test]
async fn rejected_command_recovers_on_a_later_attempt() {
    let bus = InMemoryBus::new();
    let node = start_node(&bus, "node-a", fast_settings()).await;
    node.provider.script([Script::Fail { retryable: false }]);

    publish_command(&bus, Operation::SendText).await;

    let settlements = settled(&bus, 1).await;
    assert_eq!(settlements[0].outcome, AckOutcome::Ack);
    assert_eq!(node.provider.sends().len(), 2);
    assert!(dead_letters(&bus).await.is_empty());
}

#[tokio::test]
async fn slow_handlers_time_out_and_are_retried() {
    let bus = InMemoryBus::new();
    let settings = DispatchSettings {
        handler_timeout: Duration::from_millis(20),
        max_retries: 1,
        ..fast_settings()
    };
    let node = start_node(&bus, "node-a", settings).await;
    node.provider.script([Script::Delay(Duration::from_secs(30))]);

    publish_command(&bus, Operation::SendText).await;

    let settlements = settled(&bus, 1).await;
    assert_eq!(settlements[0].outcome, AckOutcome::Ack);
    assert_eq!(node.provider.sends().len(), 2);
    assert!(dead_letters(&bus).await.is_empty());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn panics_are_dropped_and_the_pipeline_keeps_running() {
    let bus = InMemoryBus::new();
    let node = start_node(&bus, "node-a", fast_settings()).await;
    node.provider.script([Script::Panic]);

    publish_command(&bus, Operation::SendText).await;
    publish_command(&bus, Operation::SendText).await;

    let settlements = settled(&bus, 2).await;
    assert!(settlements.iter().all(|s| s.outcome == AckOutcome::Ack));
    // the panicking attempt is not retried
    assert_eq!(node.provider.sends().len(), 2);
    assert!(dead_letters(&bus).await.is_empty());
    assert!(logs_contain("PANIC_RECOVERED"));
}

#[tokio::test]
async fn redeliver_policy_dead_letters_panics() {
    let bus = InMemoryBus::new();
    let settings = DispatchSettings {
        panic_policy: PanicPolicy::RedeliverOnPanic,
        ..fast_settings()
    };
    let node = start_node(&bus, "node-a", settings).await;
    node.provider.script([Script::Panic]);

    publish_command(&bus, Operation::SendImage).await;

    let settlements = settled(&bus, 1).await;
    assert_eq!(settlements[0].outcome, AckOutcome::Ack);
    assert_eq!(node.provider.sends().len(), 1);
    let letters = dead_letters(&bus).await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].json().unwrap()["error"]["code"], "handler_panic");
}

struct BrokenSink;

#[async_trait]
impl FailureSink for BrokenSink {
    async fn dead_letter(&self, _failure: &TerminalFailure) -> Result<(), BusError> {
        Err(BusError::Publish(anyhow::anyhow!("broker unavailable")))
    }
}

#[tokio::test]
async fn failed_dead_letter_rejects_without_requeue() {
    let bus = InMemoryBus::new();
    let node = start_node_with_sink(&bus, "node-a", fast_settings(), Arc::new(BrokenSink)).await;
    node.provider
        .script(std::iter::repeat_n(Script::Fail { retryable: false }, 4));

    publish_command(&bus, Operation::SendText).await;

    let settlements = settled(&bus, 1).await;
    assert_eq!(settlements[0].outcome, AckOutcome::Nack { requeue: false });
}

#[tokio::test]
async fn shutdown_requeues_a_command_waiting_to_retry() {
    let bus = InMemoryBus::new();
    let settings = DispatchSettings {
        retry_interval: Duration::from_secs(60),
        ..fast_settings()
    };
    let node = start_node(&bus, "node-a", settings).await;
    node.provider.script([Script::Fail { retryable: true }]);

    publish_command(&bus, Operation::SendText).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while node.provider.sends().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(node.handle.shutdown(Duration::from_secs(5)).await);
    let settlements = bus.settlements().await;
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].outcome, AckOutcome::Nack { requeue: true });
    assert!(bus.active_queues().await.is_empty());
}
