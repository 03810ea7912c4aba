//! Scriptable in-memory adapter for exercising the dispatcher and webhook ingress.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use imp_core::{Message, MessageResponse};

use crate::errors::ProviderError;
use crate::traits::{Receiver, Sender};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendCall {
    Text,
    Image,
    Document,
}

/// Scripted behaviour for the next send call.
#[derive(Clone, Debug)]
pub enum Script {
    Fail { retryable: bool },
    Panic,
    Delay(Duration),
}

#[derive(Default)]
struct State {
    sends: Vec<(SendCall, Message)>,
    webhooks: Vec<Bytes>,
    script: VecDeque<Script>,
    webhook_error: Option<String>,
}

pub struct RecordingProvider {
    key: String,
    state: Mutex<State>,
}

impl RecordingProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Queues behaviours consumed one per send call; an empty script succeeds.
    pub fn script(&self, steps: impl IntoIterator<Item = Script>) {
        self.lock().script.extend(steps);
    }

    pub fn fail_webhooks_with(&self, message: impl Into<String>) {
        self.lock().webhook_error = Some(message.into());
    }

    pub fn sends(&self) -> Vec<(SendCall, Message)> {
        self.lock().sends.clone()
    }

    pub fn webhooks(&self) -> Vec<Bytes> {
        self.lock().webhooks.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn record(
        &self,
        call: SendCall,
        message: &Message,
    ) -> Result<MessageResponse, ProviderError> {
        let step = {
            let mut state = self.lock();
            state.sends.push((call, message.clone()));
            state.script.pop_front()
        };
        match step {
            None => Ok(MessageResponse::new(message.id)),
            Some(Script::Fail { retryable: true }) => {
                Err(ProviderError::retryable("platform_unavailable", "scripted failure"))
            }
            Some(Script::Fail { retryable: false }) => {
                Err(ProviderError::permanent("platform_rejected", "scripted failure"))
            }
            Some(Script::Panic) => panic!("scripted panic in {call:?}"),
            Some(Script::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(MessageResponse::new(message.id))
            }
        }
    }
}

#[async_trait]
impl Sender for RecordingProvider {
    fn provider_type(&self) -> &str {
        &self.key
    }

    async fn send_text(&self, message: &Message) -> Result<MessageResponse, ProviderError> {
        self.record(SendCall::Text, message).await
    }

    async fn send_image(&self, message: &Message) -> Result<MessageResponse, ProviderError> {
        self.record(SendCall::Image, message).await
    }

    async fn send_document(&self, message: &Message) -> Result<MessageResponse, ProviderError> {
        self.record(SendCall::Document, message).await
    }
}

#[async_trait]
impl Receiver for RecordingProvider {
    fn provider_type(&self) -> &str {
        &self.key
    }

    async fn handle_webhook(&self, payload: Bytes) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.webhooks.push(payload);
        match &state.webhook_error {
            Some(message) => Err(ProviderError::permanent("webhook_rejected", message.clone())),
            None => Ok(()),
        }
    }
}
