use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use imp_core::{Message, MessageResponse, Peer, PeerType};
use imp_rpc::{Messenger, RpcError, SendTextRequest};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::ProviderError;
use crate::traits::{Receiver, Sender};

/// Adapter that only logs traffic for its provider key.
///
/// Used for nodes that host a provider before its platform integration is wired.
/// With a messenger attached, inbound text from webhooks is forwarded to the gateway.
pub struct LoggingProvider {
    key: String,
    messenger: Option<Arc<dyn Messenger>>,
}

/// Inbound text event accepted on the webhook.
#[derive(Debug, Deserialize)]
struct InboundText {
    sender: InboundSender,
    #[serde(default)]
    text: String,
    #[serde(default)]
    domain_id: i64,
}

#[derive(Debug, Deserialize)]
struct InboundSender {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

impl LoggingProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            messenger: None,
        }
    }

    pub fn with_messenger(mut self, messenger: Arc<dyn Messenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    fn log_send(&self, operation: &'static str, message: &Message) -> MessageResponse {
        info!(
            provider = %self.key,
            operation,
            msg_id = %message.id,
            domain_id = message.domain_id,
            images = message.images.len(),
            documents = message.documents.len(),
            "logging provider accepted outbound message"
        );
        MessageResponse::new(Uuid::new_v4())
    }

    async fn forward(
        &self,
        messenger: &dyn Messenger,
        payload: &[u8],
    ) -> Result<(), ProviderError> {
        let inbound: InboundText = serde_json::from_slice(payload).map_err(|err| {
            ProviderError::permanent("invalid_payload", "webhook body is not an inbound text event")
                .caused_by(err)
        })?;
        if inbound.text.is_empty() {
            debug!(provider = %self.key, sender = %inbound.sender.id, "webhook carried no text");
            return Ok(());
        }

        let mut from = Peer::new(Uuid::nil(), PeerType::Contact)
            .with_identity(inbound.sender.id, self.key.as_str());
        if let Some(name) = inbound.sender.name {
            from = from.with_name(name);
        }
        let receipt = messenger
            .send_text(SendTextRequest {
                from,
                to: Peer::default(),
                body: inbound.text,
                domain_id: inbound.domain_id,
            })
            .await
            .map_err(gateway_error)?;
        info!(provider = %self.key, gateway_id = %receipt.id, "webhook text forwarded to gateway");
        Ok(())
    }
}

fn gateway_error(err: RpcError) -> ProviderError {
    let error = if err.is_retryable() {
        ProviderError::retryable("gateway_unavailable", err.to_string())
    } else {
        ProviderError::permanent("gateway_rejected", err.to_string())
    };
    error.caused_by(err)
}

#[async_trait]
impl Sender for LoggingProvider {
    fn provider_type(&self) -> &str {
        &self.key
    }

    async fn send_text(&self, message: &Message) -> Result<MessageResponse, ProviderError> {
        Ok(self.log_send("send_text", message))
    }

    async fn send_image(&self, message: &Message) -> Result<MessageResponse, ProviderError> {
        Ok(self.log_send("send_image", message))
    }

    async fn send_document(&self, message: &Message) -> Result<MessageResponse, ProviderError> {
        Ok(self.log_send("send_document", message))
    }
}

#[async_trait]
impl Receiver for LoggingProvider {
    fn provider_type(&self) -> &str {
        &self.key
    }

    async fn handle_webhook(&self, payload: Bytes) -> Result<(), ProviderError> {
        info!(provider = %self.key, bytes = payload.len(), "logging provider received webhook");
        match &self.messenger {
            Some(messenger) => self.forward(messenger.as_ref(), &payload).await,
            None => Ok(()),
        }
    }
}
