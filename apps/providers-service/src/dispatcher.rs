//! Bus dispatcher.
//!
//! Every outbound operation gets its own pipeline consuming an exclusive,
//! auto-delete queue named after this process instance, so each running
//! instance sees every command. A pipeline handles one delivery at a time:
//! panic guard, routing-key resolution, decode, validation, registry lookup,
//! then the adapter call under retry and timeout. Only deliveries that were
//! handled or deliberately skipped are acked; terminal failures go to the
//! [`FailureSink`] first.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use imp_bus::{BusError, Delivery, DeliveryStream, Subscriber, SubscriberConfig};
use imp_core::{
    Message, MessageCreatedV1, MessageResponse, Operation, OutboundCommand, ValidationError,
    provider_from_routing_key, routing_key_from_metadata,
};
use imp_provider_registry::{ProviderError, ProviderRegistry, Sender};
use metrics::counter;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, error, field, info, info_span, warn};
use uuid::Uuid;

use crate::config::duration;
use crate::failure::{FailureSink, TerminalFailure};

/// What happens to a delivery whose handler panicked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PanicPolicy {
    /// Acknowledge and drop the delivery.
    #[default]
    DropOnPanic,
    /// Treat it as a terminal failure and dead-letter it.
    RedeliverOnPanic,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchSettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    #[serde(deserialize_with = "duration::deserialize")]
    pub retry_interval: Duration,
    /// Upper bound for one adapter invocation.
    #[serde(deserialize_with = "duration::deserialize")]
    pub handler_timeout: Duration,
    pub panic_policy: PanicPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::from_secs(2),
            handler_timeout: Duration::from_secs(30),
            panic_policy: PanicPolicy::DropOnPanic,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
    #[error("handler panicked: {0}")]
    Panic(String),
    #[error("dispatch cancelled by shutdown")]
    Cancelled,
}

impl DispatchError {
    pub fn code(&self) -> &str {
        match self {
            DispatchError::Provider(err) => err.code(),
            DispatchError::Timeout(_) => "handler_timeout",
            DispatchError::Panic(_) => "handler_panic",
            DispatchError::Cancelled => "cancelled",
        }
    }

    /// Every adapter error and timeout is retried within the attempt budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Provider(_) | DispatchError::Timeout(_) => true,
            DispatchError::Panic(_) | DispatchError::Cancelled => false,
        }
    }
}

/// Why a delivery was acknowledged without reaching an adapter.
#[derive(Debug)]
pub enum Skip {
    NoRoutingKey,
    Decode(String),
    Validation(ValidationError),
    UnknownProvider(String),
    PanicDropped(String),
}

#[derive(Debug)]
pub enum Outcome {
    Handled {
        provider: String,
        attempts: u32,
    },
    Skipped(Skip),
    Failed {
        provider: Option<String>,
        error: DispatchError,
        attempts: u32,
    },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Handled { .. } => "handled",
            Outcome::Skipped(Skip::NoRoutingKey) => "no_routing_key",
            Outcome::Skipped(Skip::Decode(_)) => "decode_error",
            Outcome::Skipped(Skip::Validation(_)) => "invalid",
            Outcome::Skipped(Skip::UnknownProvider(_)) => "unknown_provider",
            Outcome::Skipped(Skip::PanicDropped(_)) => "panic_dropped",
            Outcome::Failed { .. } => "failed",
        }
    }
}

/// Short per-process identifier used in queue names.
pub fn new_instance_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

struct Inner {
    registry: Arc<ProviderRegistry>,
    settings: DispatchSettings,
    sink: Arc<dyn FailureSink>,
    span: Span,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        settings: DispatchSettings,
        sink: Arc<dyn FailureSink>,
        span: Span,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                settings,
                sink,
                span,
            }),
        }
    }

    /// Subscribes one pipeline per operation and starts consuming.
    pub async fn start(
        &self,
        subscriber: &dyn Subscriber,
        exchange: &str,
        instance_id: &str,
    ) -> Result<DispatcherHandle, BusError> {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut queues = Vec::with_capacity(Operation::ALL.len());

        for operation in Operation::ALL {
            let config = SubscriberConfig::fan_out(
                operation.queue_name(instance_id),
                exchange,
                operation.binding_pattern(),
            );
            let stream = match subscriber.subscribe(&config).await {
                Ok(stream) => stream,
                Err(err) => {
                    cancel.cancel();
                    tracker.close();
                    return Err(err);
                }
            };
            info!(
                parent: &self.inner.span,
                queue = %config.queue,
                binding = %config.binding,
                "pipeline subscribed"
            );
            queues.push(config.queue);
            tracker.spawn(
                self.clone()
                    .pipeline(operation, stream, cancel.clone())
                    .instrument(self.inner.span.clone()),
            );
        }
        tracker.close();

        Ok(DispatcherHandle {
            cancel,
            tracker,
            queues,
        })
    }

    async fn pipeline(self, operation: Operation, mut stream: DeliveryStream, cancel: CancellationToken) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(delivery) => delivery,
                    None => {
                        warn!(%operation, "subscription closed by the broker");
                        break;
                    }
                },
            };
            let outcome = self.dispatch(operation, &delivery, &cancel).await;
            self.settle(operation, delivery, outcome).await;
        }
        drop(stream);
        debug!(%operation, "pipeline stopped");
    }

    /// Runs the full handling chain for one delivery. Never panics.
    pub async fn dispatch(
        &self,
        operation: Operation,
        delivery: &Delivery,
        cancel: &CancellationToken,
    ) -> Outcome {
        let routing_key = routing_key_from_metadata(|key| delivery.header(key));
        let provider = routing_key.and_then(provider_from_routing_key);
        let span = info_span!(
            parent: &self.inner.span,
            "dispatch",
            operation = %operation,
            msg_id = %delivery.id,
            provider = field::Empty,
        );
        imp_telemetry::with_message_fields(&span, provider, &delivery.id);

        let guarded = AssertUnwindSafe(self.process(operation, provider, &delivery.payload, cancel))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        match guarded {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(parent: &span, panic = %reason, "PANIC_RECOVERED");
                match self.inner.settings.panic_policy {
                    PanicPolicy::DropOnPanic => Outcome::Skipped(Skip::PanicDropped(reason)),
                    PanicPolicy::RedeliverOnPanic => Outcome::Failed {
                        provider: provider.map(str::to_string),
                        error: DispatchError::Panic(reason),
                        attempts: 1,
                    },
                }
            }
        }
    }

    async fn process(
        &self,
        operation: Operation,
        provider: Option<&str>,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Outcome {
        let Some(provider) = provider else {
            warn!("ROUTING_FAILED: no provider in routing key");
            return Outcome::Skipped(Skip::NoRoutingKey);
        };

        let message = match decode::<MessageCreatedV1>(payload) {
            Ok(message) => message,
            Err(skip) => return Outcome::Skipped(skip),
        };

        let Some(sender) = self.inner.registry.sender(provider) else {
            warn!(provider, "SKIPPED: provider not registered");
            return Outcome::Skipped(Skip::UnknownProvider(provider.to_string()));
        };

        self.send_with_retry(operation, provider, sender.as_ref(), &message, cancel)
            .await
    }

    async fn send_with_retry(
        &self,
        operation: Operation,
        provider: &str,
        sender: &dyn Sender,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Outcome {
        let settings = &self.inner.settings;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let call = send(sender, operation, message);
            let error = match tokio::time::timeout(settings.handler_timeout, call).await {
                Ok(Ok(response)) => {
                    debug!(attempt, response_id = %response.id, "delivered to provider");
                    return Outcome::Handled {
                        provider: provider.to_string(),
                        attempts: attempt,
                    };
                }
                Ok(Err(err)) => DispatchError::Provider(err),
                Err(_) => DispatchError::Timeout(settings.handler_timeout),
            };

            if !error.is_retryable() || attempt > settings.max_retries {
                error!(attempt, error = %error, "dispatch failed");
                return Outcome::Failed {
                    provider: Some(provider.to_string()),
                    error,
                    attempts: attempt,
                };
            }
            warn!(attempt, error = %error, delay = ?settings.retry_interval, "retrying dispatch");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Outcome::Failed {
                        provider: Some(provider.to_string()),
                        error: DispatchError::Cancelled,
                        attempts: attempt,
                    };
                }
                _ = tokio::time::sleep(settings.retry_interval) => {}
            }
        }
    }

    /// Acks, nacks or dead-letters the delivery according to `outcome`.
    pub async fn settle(&self, operation: Operation, delivery: Delivery, outcome: Outcome) {
        counter!(
            "imp_dispatch_total",
            "operation" => operation.name(),
            "outcome" => outcome.label(),
        )
        .increment(1);

        let settled = match outcome {
            Outcome::Handled { .. } | Outcome::Skipped(_) => delivery.ack().await,
            Outcome::Failed {
                error: DispatchError::Cancelled,
                ..
            } => delivery.nack(true).await,
            Outcome::Failed {
                provider,
                error,
                attempts,
            } => {
                let routing_key = routing_key_from_metadata(|key| delivery.header(key))
                    .unwrap_or(delivery.subject.as_str())
                    .to_string();
                let failure = TerminalFailure {
                    operation,
                    provider,
                    routing_key,
                    msg_id: delivery.id.clone(),
                    attempts,
                    code: error.code().to_string(),
                    reason: error.to_string(),
                    payload: delivery.payload.clone(),
                };
                match self.inner.sink.dead_letter(&failure).await {
                    Ok(()) => delivery.ack().await,
                    Err(err) => {
                        error!(
                            parent: &self.inner.span,
                            msg_id = %failure.msg_id,
                            error = %err,
                            "dead-letter publish failed; rejecting delivery"
                        );
                        delivery.nack(false).await
                    }
                }
            }
        };
        if let Err(err) = settled {
            warn!(parent: &self.inner.span, error = %err, "failed to settle delivery");
        }
    }
}

/// Running pipelines.
pub struct DispatcherHandle {
    cancel: CancellationToken,
    tracker: TaskTracker,
    queues: Vec<String>,
}

impl DispatcherHandle {
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Stops consuming and waits up to `grace` for in-flight deliveries.
    /// Returns `false` when the grace period ran out.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.cancel.cancel();
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }
}

fn decode<C: OutboundCommand>(payload: &[u8]) -> Result<Message, Skip> {
    let command: C = serde_json::from_slice(payload).map_err(|err| {
        error!(error = %err, "DECODE_FAILED");
        Skip::Decode(err.to_string())
    })?;
    command.validate().map_err(|err| {
        warn!(message_id = command.message_id(), error = %err, "VALIDATION_FAILED");
        Skip::Validation(err)
    })?;
    Ok(command.to_domain())
}

async fn send(
    sender: &dyn Sender,
    operation: Operation,
    message: &Message,
) -> Result<MessageResponse, ProviderError> {
    match operation {
        Operation::SendText => sender.send_text(message).await,
        Operation::SendImage => sender.send_image(message).await,
        Operation::SendDocument => sender.send_document(message).await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_are_short_and_distinct() {
        let a = new_instance_id();
        let b = new_instance_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn adapter_errors_and_timeouts_retry() {
        assert!(DispatchError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(DispatchError::Provider(ProviderError::permanent("bad", "x")).is_retryable());
        assert!(DispatchError::Provider(ProviderError::retryable("down", "x")).is_retryable());
        assert!(!DispatchError::Panic("boom".into()).is_retryable());
        assert!(!DispatchError::Cancelled.is_retryable());
    }

    #[test]
    fn panic_payloads_render() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
    }

    #[test]
    fn panic_policy_names() {
        let policy: PanicPolicy = serde_json::from_str("\"redeliver-on-panic\"").unwrap();
        assert_eq!(policy, PanicPolicy::RedeliverOnPanic);
    }
}
