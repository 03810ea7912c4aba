//! Domain entities shared by the webhook ingress, the bus dispatcher and the
//! provider adapters.
//!
//! Values are built once (usually from a decoded command) and handed to adapters
//! by shared reference, so nothing downstream can mutate them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of addressable identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerType {
    #[default]
    Contact,
    Group,
    Channel,
}

impl PeerType {
    /// Wire code used by the bus payloads (`1` contact, `2` group, `3` channel).
    pub fn code(self) -> i32 {
        match self {
            PeerType::Contact => 1,
            PeerType::Group => 2,
            PeerType::Channel => 3,
        }
    }

    /// Unknown codes (including the unset `0`) resolve to a contact.
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => PeerType::Group,
            3 => PeerType::Channel,
            _ => PeerType::Contact,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerType::Contact => "contact",
            PeerType::Group => "group",
            PeerType::Channel => "channel",
        }
    }
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An addressable identity on either side of the bridge.
///
/// Identity claims and display names are attached through the consuming
/// `with_*` options at construction time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: PeerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Peer {
    pub fn new(id: Uuid, kind: PeerType) -> Self {
        Self {
            id,
            kind,
            sub: None,
            issuer: None,
            name: None,
        }
    }

    /// Attaches the external identity provider claims.
    pub fn with_identity(mut self, sub: impl Into<String>, issuer: impl Into<String>) -> Self {
        self.sub = Some(sub.into());
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub size: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub url: String,
}

/// Canonical message handed to provider adapters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub domain_id: i64,
    pub from: Peer,
    pub to: Peer,
    pub text: String,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<Document>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
}

/// Result of a provider send operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl MessageResponse {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            metadata: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_type_codes_are_stable() {
        for kind in [PeerType::Contact, PeerType::Group, PeerType::Channel] {
            assert_eq!(PeerType::from_code(kind.code()), kind);
        }
        assert_eq!(PeerType::from_code(0), PeerType::Contact);
        assert_eq!(PeerType::from_code(42), PeerType::Contact);
    }

    #[test]
    fn peer_options_are_additive() {
        let id = Uuid::new_v4();
        let base = Peer::new(id, PeerType::Group);
        let enriched = base.clone().with_identity("sub-1", "iss-1").with_name("Ops");

        assert_eq!(base.sub, None);
        assert_eq!(enriched.id, id);
        assert_eq!(enriched.kind, PeerType::Group);
        assert_eq!(enriched.sub.as_deref(), Some("sub-1"));
        assert_eq!(enriched.issuer.as_deref(), Some("iss-1"));
        assert_eq!(enriched.name.as_deref(), Some("Ops"));
    }
}
