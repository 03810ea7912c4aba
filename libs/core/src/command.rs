//! Outbound send-commands consumed from the message bus.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Document, Image, Message, Peer, PeerType};
use crate::parse::{lenient_rfc3339_millis, lenient_uuid};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: &'static str,
}

impl ValidationError {
    pub fn required(field: &'static str) -> Self {
        Self {
            field,
            reason: "is required",
        }
    }
}

/// A bus command that can be turned into a domain [`Message`].
///
/// Commands without validation rules keep the default `validate`.
pub trait OutboundCommand: DeserializeOwned + Send + 'static {
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }

    fn to_domain(&self) -> Message;

    /// Identifier used in logs and dead-letter records.
    fn message_id(&self) -> &str;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDto {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: i32,
}

impl PeerDto {
    pub fn to_domain(&self) -> Peer {
        Peer::new(lenient_uuid(&self.id), PeerType::from_code(self.kind))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDto {
    #[serde(default)]
    pub file_id: i64,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDto {
    #[serde(default)]
    pub file_id: i64,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: i64,
}

/// `im_message.events` payload shared by the text, image and document operations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCreatedV1 {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub domain_id: i32,
    #[serde(default)]
    pub from: PeerDto,
    #[serde(default)]
    pub to: PeerDto,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub occurred_at: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub images: Vec<ImageDto>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub documents: Vec<DocumentDto>,
}

impl MessageCreatedV1 {
    fn map_images(&self) -> Vec<Image> {
        self.images
            .iter()
            .map(|img| Image {
                id: img.file_id.to_string(),
                file_name: img.name.clone(),
                mime_type: img.mime.clone(),
                url: img.url.clone(),
            })
            .collect()
    }

    fn map_documents(&self) -> Vec<Document> {
        self.documents
            .iter()
            .map(|doc| Document {
                id: doc.file_id.to_string(),
                file_name: doc.name.clone(),
                mime_type: doc.mime.clone(),
                size: doc.size,
            })
            .collect()
    }
}

impl OutboundCommand for MessageCreatedV1 {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.message_id.trim().is_empty() {
            return Err(ValidationError::required("message_id"));
        }
        if self.domain_id == 0 {
            return Err(ValidationError::required("domain_id"));
        }
        Ok(())
    }

    fn to_domain(&self) -> Message {
        Message {
            id: lenient_uuid(&self.message_id),
            thread_id: lenient_uuid(&self.thread_id),
            domain_id: i64::from(self.domain_id),
            from: self.from.to_domain(),
            to: self.to.to_domain(),
            text: self.body.clone(),
            created_at: lenient_rfc3339_millis(&self.occurred_at),
            edited_at: None,
            metadata: BTreeMap::new(),
            documents: self.map_documents(),
            images: self.map_images(),
        }
    }

    fn message_id(&self) -> &str {
        &self.message_id
    }
}

// Producers emit `null` for empty attachment lists.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
