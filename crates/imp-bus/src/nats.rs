//! NATS transport.
//!
//! Exclusive queues map to plain subscriptions so every instance sees every
//! matching message; shared queues map to queue groups named after the queue.
//! Core NATS keeps nothing across restarts, so durable queues are refused.
//!
//! Core NATS has no exchanges: subjects are global and publishers send to the
//! routing key itself. The exchange name is validated and logged but never
//! changes the subscribed subject, so every exchange shares one subject space.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{Span, debug};

use crate::delivery::NoAck;
use crate::{
    BusClient, BusError, Delivery, DeliveryStream, Headers, Subscriber, SubscriberConfig,
    TopologyError,
};

pub struct NatsBusClient {
    client: async_nats::Client,
}

impl NatsBusClient {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BusClient for NatsBusClient {
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
    ) -> Result<(), BusError> {
        let result = if headers.is_empty() {
            self.client.publish(subject.to_string(), payload).await
        } else {
            let mut map = async_nats::HeaderMap::new();
            for (name, value) in &headers {
                map.insert(name.as_str(), value.as_str());
            }
            self.client
                .publish_with_headers(subject.to_string(), map, payload)
                .await
        };
        result.map_err(|err| BusError::Publish(anyhow::Error::new(err)))
    }
}

pub struct NatsSubscriber {
    client: async_nats::Client,
    span: Span,
}

impl NatsSubscriber {
    pub fn new(client: async_nats::Client, span: Span) -> Self {
        Self { client, span }
    }
}

#[async_trait]
impl Subscriber for NatsSubscriber {
    async fn subscribe(&self, config: &SubscriberConfig) -> Result<DeliveryStream, BusError> {
        config.validate()?;
        if config.durable_queue {
            return Err(TopologyError::Unsupported(format!(
                "durable queue `{}` on core NATS",
                config.queue
            ))
            .into());
        }
        let subject = subscription_subject(config);
        let subscription = if config.exclusive_queue {
            self.client.subscribe(subject.clone()).await
        } else {
            self.client
                .queue_subscribe(subject.clone(), config.queue.clone())
                .await
        }
        .map_err(|err| BusError::Subscribe(anyhow::Error::new(err)))?;

        self.span.in_scope(|| {
            debug!(
                queue = %config.queue,
                exchange = %config.exchange.name,
                subject = %subject,
                exclusive = config.exclusive_queue,
                "subscribed"
            )
        });
        Ok(subscription.map(into_delivery).boxed())
    }
}

fn into_delivery(message: async_nats::Message) -> Delivery {
    let mut metadata = Headers::new();
    if let Some(headers) = &message.headers {
        for (name, values) in headers.iter() {
            if let Some(value) = values.iter().next() {
                metadata.insert(name.to_string(), value.to_string());
            }
        }
    }
    Delivery::new(
        message.subject.to_string(),
        metadata,
        message.payload,
        Box::new(NoAck),
    )
}

fn subscription_subject(config: &SubscriberConfig) -> String {
    nats_subject(&config.binding)
}

/// NATS spells the multi-level wildcard `>`.
fn nats_subject(binding: &str) -> String {
    binding
        .split('.')
        .map(|segment| if segment == "#" { ">" } else { segment })
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::{nats_subject, subscription_subject};
    use crate::SubscriberConfig;

    #[test]
    fn hash_wildcard_becomes_gt() {
        assert_eq!(nats_subject("a.*.b.#"), "a.*.b.>");
        assert_eq!(nats_subject("a.b"), "a.b");
    }

    #[test]
    fn exchange_does_not_scope_the_subject() {
        let events = SubscriberConfig::fan_out("q-1", "im_message.events", "im_provider.#");
        let other = SubscriberConfig::fan_out("q-1", "other.events", "im_provider.#");
        assert_eq!(subscription_subject(&events), "im_provider.>");
        assert_eq!(subscription_subject(&events), subscription_subject(&other));
    }
}
