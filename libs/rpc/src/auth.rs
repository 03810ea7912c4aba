use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::gateway::GatewayApi;

/// Identity behind a set of credentials.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthContact {
    pub contact_id: String,
    pub sub: String,
    pub iss: String,
    pub name: String,
}

#[derive(Clone)]
pub struct AuthService {
    gateway: GatewayApi,
}

impl AuthService {
    pub fn new(gateway: GatewayApi) -> Self {
        Self { gateway }
    }

    /// Forwards every incoming header (access token, device, client, ...) to
    /// the gateway's `Inspect` call.
    pub async fn inspect(&self, headers: &HeaderMap) -> Result<AuthContact, RpcError> {
        if headers.is_empty() {
            return Err(RpcError::InvalidRequest("no credentials to inspect".into()));
        }
        let authorization = self.gateway.inspect(headers.clone()).await?;
        let contact = authorization.contact.ok_or_else(|| RpcError::Application {
            status: None,
            message: "identity inspection returned no contact".into(),
        })?;
        Ok(AuthContact {
            contact_id: contact.id,
            sub: contact.sub,
            iss: contact.iss,
            name: contact.name,
        })
    }
}
