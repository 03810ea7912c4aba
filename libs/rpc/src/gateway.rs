//! Typed stub for the internal IM gateway, spoken as JSON over HTTP at
//! `<endpoint>/v1/<service>/<method>`.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::Span;

use crate::breaker::BreakerRegistry;
use crate::client::{ResilientClient, RpcSettings};
use crate::discovery::{Discovery, Endpoint};
use crate::error::{CallError, RpcError};
use crate::wire::{
    Authorization, ContactList, InspectRequest, LogoutRequest, LogoutResponse,
    RegisterDeviceRequest, RegisterDeviceResponse, SearchContactRequest, SendDocumentRequest,
    SendImageRequest, SendResponse, SendTextRequest, TokenRequest, UnregisterDeviceRequest,
    UnregisterDeviceResponse,
};

/// Discovery name of the gateway.
pub const GATEWAY_SERVICE: &str = "im-gateway-service";

const MESSAGE: &str = "message";
const ACCOUNT: &str = "account";
const CONTACTS: &str = "contacts";

/// One endpoint's HTTP stub.
#[derive(Clone)]
pub struct HttpStub {
    http: reqwest::Client,
    endpoint: Endpoint,
}

impl HttpStub {
    pub fn new(http: reqwest::Client, endpoint: Endpoint) -> Self {
        Self { http, endpoint }
    }

    pub async fn call<Req, Resp>(
        &self,
        path: &str,
        body: &Req,
        headers: HeaderMap,
    ) -> Result<Resp, CallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.endpoint.url(path))
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }
        response
            .json::<Resp>()
            .await
            .map_err(|err| CallError::application(Some(status.as_u16()), format!("invalid response body: {err}")))
    }
}

fn classify(err: reqwest::Error) -> CallError {
    if err.is_builder() {
        CallError::application(None, err.to_string())
    } else {
        CallError::transient(err)
    }
}

fn classify_status(status: StatusCode, body: String) -> CallError {
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            CallError::transient(anyhow::anyhow!("HTTP {status}: {body}"))
        }
        _ => CallError::application(Some(status.as_u16()), body),
    }
}

/// Gateway client; every call goes through the resilient client.
#[derive(Clone)]
pub struct GatewayApi {
    rpc: ResilientClient<HttpStub>,
}

impl GatewayApi {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        breakers: BreakerRegistry,
        settings: &RpcSettings,
        span: Span,
    ) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| RpcError::InvalidRequest(format!("http client: {err}")))?;
        let rpc = ResilientClient::new(
            GATEWAY_SERVICE,
            discovery,
            breakers,
            settings,
            span,
            move |endpoint: &Endpoint| HttpStub::new(http.clone(), endpoint.clone()),
        );
        Ok(Self { rpc })
    }

    pub fn from_client(rpc: ResilientClient<HttpStub>) -> Self {
        Self { rpc }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        self.rpc.breakers()
    }

    async fn call<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
        headers: HeaderMap,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        let path = format!("v1/{service}/{method}");
        self.rpc
            .execute(|stub| {
                let path = path.clone();
                let headers = headers.clone();
                async move { stub.call(&path, request, headers).await }
            })
            .await
    }

    pub async fn send_text(&self, request: &SendTextRequest) -> Result<SendResponse, RpcError> {
        self.call(MESSAGE, "SendText", request, HeaderMap::new()).await
    }

    pub async fn send_image(&self, request: &SendImageRequest) -> Result<SendResponse, RpcError> {
        self.call(MESSAGE, "SendImage", request, HeaderMap::new()).await
    }

    pub async fn send_file(
        &self,
        request: &SendDocumentRequest,
    ) -> Result<SendResponse, RpcError> {
        self.call(MESSAGE, "SendFile", request, HeaderMap::new()).await
    }

    pub async fn token(&self, request: &TokenRequest) -> Result<Authorization, RpcError> {
        self.call(ACCOUNT, "Token", request, HeaderMap::new()).await
    }

    /// Inspects the credentials carried by `headers`.
    pub async fn inspect(&self, headers: HeaderMap) -> Result<Authorization, RpcError> {
        self.call(ACCOUNT, "Inspect", &InspectRequest {}, headers).await
    }

    pub async fn logout(&self, headers: HeaderMap) -> Result<LogoutResponse, RpcError> {
        self.call(ACCOUNT, "Logout", &LogoutRequest {}, headers).await
    }

    pub async fn register_device(
        &self,
        request: &RegisterDeviceRequest,
        headers: HeaderMap,
    ) -> Result<RegisterDeviceResponse, RpcError> {
        self.call(ACCOUNT, "RegisterDevice", request, headers).await
    }

    pub async fn unregister_device(
        &self,
        request: &UnregisterDeviceRequest,
        headers: HeaderMap,
    ) -> Result<UnregisterDeviceResponse, RpcError> {
        self.call(ACCOUNT, "UnregisterDevice", request, headers).await
    }

    pub async fn search(&self, request: &SearchContactRequest) -> Result<ContactList, RpcError> {
        self.call(CONTACTS, "Search", request, HeaderMap::new()).await
    }
}
