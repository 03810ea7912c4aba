//! Messenger service: forwards inbound platform messages to the gateway.

use async_trait::async_trait;
use imp_core::Peer;
use serde::{Deserialize, Serialize};
use tracing::{Span, warn};
use uuid::Uuid;

use crate::error::RpcError;
use crate::gateway::GatewayApi;
use crate::wire;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SendTextRequest {
    pub from: Peer,
    pub to: Peer,
    pub body: String,
    pub domain_id: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageAttachment {
    pub id: i64,
    pub url: String,
    pub mime_type: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageBatch {
    pub body: String,
    pub images: Vec<ImageAttachment>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SendImageRequest {
    pub from: Peer,
    pub to: Peer,
    pub image: ImageBatch,
    pub domain_id: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentAttachment {
    pub id: i64,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub url: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentBatch {
    pub body: String,
    pub documents: Vec<DocumentAttachment>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SendDocumentRequest {
    pub from: Peer,
    pub to: Peer,
    pub document: DocumentBatch,
    pub domain_id: i64,
}

/// Gateway-assigned id of a forwarded message.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SendReceipt {
    pub to: Peer,
    pub id: Uuid,
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, request: SendTextRequest) -> Result<SendReceipt, RpcError>;
    async fn send_image(&self, request: SendImageRequest) -> Result<SendReceipt, RpcError>;
    async fn send_document(&self, request: SendDocumentRequest)
    -> Result<SendReceipt, RpcError>;
}

pub struct MessengerService {
    gateway: GatewayApi,
    span: Span,
}

impl MessengerService {
    pub fn new(gateway: GatewayApi, span: Span) -> Self {
        Self { gateway, span }
    }

    fn parse_id(&self, raw: &str) -> Uuid {
        Uuid::parse_str(raw).unwrap_or_else(|_| {
            self.span
                .in_scope(|| warn!(raw_id = raw, "invalid uuid in gateway response"));
            Uuid::nil()
        })
    }
}

/// The gateway addresses the sending contact by its external identity.
fn sender_identity(from: &Peer) -> wire::GatewayPeer {
    wire::GatewayPeer::contact(
        from.sub.clone().unwrap_or_else(|| from.id.to_string()),
        from.issuer.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl Messenger for MessengerService {
    async fn send_text(&self, request: SendTextRequest) -> Result<SendReceipt, RpcError> {
        let response = self
            .gateway
            .send_text(&wire::SendTextRequest {
                to: sender_identity(&request.from),
                body: request.body,
            })
            .await?;
        Ok(SendReceipt {
            id: self.parse_id(&response.id),
            to: request.to,
        })
    }

    async fn send_image(&self, request: SendImageRequest) -> Result<SendReceipt, RpcError> {
        let images = request
            .image
            .images
            .into_iter()
            .map(|image| wire::ImageInput {
                id: image.id.to_string(),
                name: image.name,
                link: image.url,
                mime_type: image.mime_type,
            })
            .collect();
        let response = self
            .gateway
            .send_image(&wire::SendImageRequest {
                to: sender_identity(&request.from),
                image: wire::ImageRequest {
                    body: request.image.body,
                    images,
                },
            })
            .await?;
        Ok(SendReceipt {
            id: self.parse_id(&response.id),
            to: request.to,
        })
    }

    async fn send_document(
        &self,
        request: SendDocumentRequest,
    ) -> Result<SendReceipt, RpcError> {
        let documents = request
            .document
            .documents
            .into_iter()
            .map(|doc| wire::DocumentInput {
                id: doc.id.to_string(),
                url: doc.url,
                file_name: doc.name,
                mime_type: doc.mime_type,
                size_bytes: Some(doc.size),
            })
            .collect();
        let response = self
            .gateway
            .send_file(&wire::SendDocumentRequest {
                to: sender_identity(&request.from),
                document: wire::DocumentRequest {
                    body: request.document.body,
                    documents,
                },
            })
            .await?;
        Ok(SendReceipt {
            id: self.parse_id(&response.id),
            to: request.to,
        })
    }
}
