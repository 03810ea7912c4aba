//! Dead-letter records for commands the dispatcher gave up on.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::{BusClient, BusError, Headers, MSG_ID_HEADER};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadLetterError {
    pub code: String,
    pub message: String,
}

/// Payload published for each dead-lettered command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterRecord {
    pub operation: String,
    #[serde(default)]
    pub provider: Option<String>,
    pub routing_key: String,
    pub msg_id: String,
    pub attempts: u32,
    pub ts: String,
    pub error: DeadLetterError,
    /// Original payload; JSON when it parsed, otherwise the raw text.
    pub envelope: Value,
}

impl DeadLetterRecord {
    pub fn new(
        operation: impl Into<String>,
        routing_key: impl Into<String>,
        msg_id: impl Into<String>,
        error: DeadLetterError,
        payload: &[u8],
    ) -> Self {
        let envelope = serde_json::from_slice(payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()));
        Self {
            operation: operation.into(),
            provider: None,
            routing_key: routing_key.into(),
            msg_id: msg_id.into(),
            attempts: 0,
            ts: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z")),
            error,
            envelope,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Publishes the record, tagging it with the original message id.
    pub async fn publish(&self, bus: &dyn BusClient, subject: &str) -> Result<(), BusError> {
        let body = serde_json::to_vec(self).map_err(|e| BusError::Publish(e.into()))?;
        let mut headers = Headers::new();
        headers.insert(MSG_ID_HEADER.to_string(), self.msg_id.clone());
        bus.publish(subject, headers, Bytes::from(body)).await
    }
}
