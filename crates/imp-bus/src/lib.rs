//! Bus publish/subscribe contracts for the providers service.
//!
//! Publishing goes through [`BusClient`]; consumption goes through
//! [`Subscriber`], which turns a [`SubscriberConfig`] into a stream of
//! [`Delivery`] values that must be acknowledged explicitly. Both have a NATS
//! implementation and an in-memory one used by tests.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;

pub mod dead_letter;
pub mod delivery;
pub mod memory;
pub mod nats;
pub mod topology;

pub use dead_letter::{DeadLetterError, DeadLetterRecord};
pub use delivery::{AckOutcome, Acknowledger, Delivery, MSG_ID_HEADER, ROUTING_KEY_METADATA};
pub use memory::{InMemoryBus, Published, Settlement};
pub use nats::{NatsBusClient, NatsSubscriber};
pub use topology::{
    ExchangeConfig, ExchangeKind, SubscriberConfig, TopologyError, topic_matches,
};

/// Message headers / delivery metadata.
pub type Headers = HashMap<String, String>;

/// Stream of deliveries for one subscription. Dropping it unsubscribes.
pub type DeliveryStream = BoxStream<'static, Delivery>;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error(transparent)]
    Publish(#[from] anyhow::Error),
    #[error("subscribe failed: {0}")]
    Subscribe(#[source] anyhow::Error),
    #[error("acknowledgement failed: {0}")]
    Ack(#[source] anyhow::Error),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

#[async_trait]
pub trait BusClient: Send + Sync {
    async fn publish(&self, subject: &str, headers: Headers, payload: Bytes)
    -> Result<(), BusError>;

    async fn publish_value(&self, subject: &str, payload: Value) -> Result<(), BusError> {
        let bytes = serde_json::to_vec(&payload).map_err(|e| BusError::Publish(e.into()))?;
        self.publish(subject, Headers::new(), Bytes::from(bytes)).await
    }
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Declares the topology described by `config` and starts consuming.
    async fn subscribe(&self, config: &SubscriberConfig) -> Result<DeliveryStream, BusError>;
}

pub fn to_value<T: serde::Serialize>(payload: &T) -> Result<Value, BusError> {
    serde_json::to_value(payload).map_err(|e| BusError::Publish(anyhow::Error::new(e)))
}
