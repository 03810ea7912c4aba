//! JSON bodies exchanged with the gateway.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerIdentity {
    pub sub: String,
    pub iss: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayPeer {
    Contact(PeerIdentity),
    Group { id: String },
    Channel { id: String },
}

impl GatewayPeer {
    pub fn contact(sub: impl Into<String>, iss: impl Into<String>) -> Self {
        GatewayPeer::Contact(PeerIdentity {
            sub: sub.into(),
            iss: iss.into(),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendTextRequest {
    pub to: GatewayPeer,
    pub body: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendResponse {
    #[serde(default)]
    pub id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageInput {
    pub id: String,
    pub name: String,
    pub link: String,
    pub mime_type: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRequest {
    pub body: String,
    pub images: Vec<ImageInput>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendImageRequest {
    pub to: GatewayPeer,
    pub image: ImageRequest,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentInput {
    pub id: String,
    pub url: String,
    pub file_name: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentRequest {
    pub body: String,
    pub documents: Vec<DocumentInput>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendDocumentRequest {
    pub to: GatewayPeer,
    pub document: DocumentRequest,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenRequest {
    pub grant_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Authorization {
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub contact: Option<Contact>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InspectRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogoutRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogoutResponse {}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterDeviceRequest {
    pub device_id: String,
    pub push_token: String,
    #[serde(default)]
    pub platform: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterDeviceResponse {}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnregisterDeviceRequest {
    pub device_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnregisterDeviceResponse {}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchContactRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub size: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactList {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub next: bool,
    #[serde(default)]
    pub data: Vec<Contact>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contact_peer_is_tagged() {
        let request = SendTextRequest {
            to: GatewayPeer::contact("sub-1", "whatsapp"),
            body: "hi".into(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"to": {"contact": {"sub": "sub-1", "iss": "whatsapp"}}, "body": "hi"})
        );
    }
}
