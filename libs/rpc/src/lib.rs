//! Resilient access to the internal IM gateway.
//!
//! Calls resolve their target through [`Discovery`], pass a per-target
//! circuit breaker, and retry transient failures with backoff. The
//! [`Messenger`] and [`AuthService`] facades used by provider adapters sit on
//! top of [`GatewayApi`].

pub mod auth;
pub mod breaker;
pub mod client;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod messenger;
pub mod retry;
pub mod wire;

pub use auth::{AuthContact, AuthService};
pub use breaker::{BreakerPhase, BreakerRegistry, BreakerSettings, Permit};
pub use client::{ResilientClient, RpcSettings};
pub use discovery::{ConsulDiscovery, Discovery, Endpoint, StaticDiscovery};
pub use error::{CallError, DiscoveryError, RpcError};
pub use gateway::{GATEWAY_SERVICE, GatewayApi, HttpStub};
pub use messenger::{
    DocumentAttachment, DocumentBatch, ImageAttachment, ImageBatch, Messenger, MessengerService,
    SendDocumentRequest, SendImageRequest, SendReceipt, SendTextRequest,
};
pub use retry::RetryPolicy;
