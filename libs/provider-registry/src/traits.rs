use async_trait::async_trait;
use bytes::Bytes;
use imp_core::{Message, MessageResponse};

use crate::errors::ProviderError;

/// Outgoing half of a provider adapter: delivers messages to the external platform.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Provider identifier, e.g. `"facebook"`.
    fn provider_type(&self) -> &str;

    async fn send_text(&self, message: &Message) -> Result<MessageResponse, ProviderError>;

    async fn send_image(&self, message: &Message) -> Result<MessageResponse, ProviderError>;

    async fn send_document(&self, message: &Message) -> Result<MessageResponse, ProviderError>;
}

/// Incoming half of a provider adapter: consumes raw webhook payloads.
#[async_trait]
pub trait Receiver: Send + Sync {
    fn provider_type(&self) -> &str;

    async fn handle_webhook(&self, payload: Bytes) -> Result<(), ProviderError>;
}
