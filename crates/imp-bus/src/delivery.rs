//! Inbound deliveries and their acknowledgement handles.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::{BusError, Headers};

/// Header carrying a publisher-assigned message id.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";
/// Metadata key under which transports expose the delivery routing key.
pub const ROUTING_KEY_METADATA: &str = "routing_key";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    Ack,
    Nack { requeue: bool },
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn settle(&self, outcome: AckOutcome) -> Result<(), BusError>;
}

/// Core NATS has no acknowledgements; settling is a no-op.
pub(crate) struct NoAck;

#[async_trait]
impl Acknowledger for NoAck {
    async fn settle(&self, _outcome: AckOutcome) -> Result<(), BusError> {
        Ok(())
    }
}

pub struct Delivery {
    pub subject: String,
    pub metadata: Headers,
    pub payload: Bytes,
    pub id: String,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Builds a delivery; `routing_key` metadata defaults to the subject and the
    /// id comes from [`MSG_ID_HEADER`] when present.
    pub fn new(
        subject: impl Into<String>,
        mut metadata: Headers,
        payload: Bytes,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        let subject = subject.into();
        metadata
            .entry(ROUTING_KEY_METADATA.to_string())
            .or_insert_with(|| subject.clone());
        let id = metadata
            .get(MSG_ID_HEADER)
            .filter(|id| !id.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            subject,
            metadata,
            payload,
            id,
            acker,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.metadata.get(name).map(String::as_str)
    }

    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.settle(AckOutcome::Ack).await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BusError> {
        self.acker.settle(AckOutcome::Nack { requeue }).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("id", &self.id)
            .field("metadata", &self.metadata)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
