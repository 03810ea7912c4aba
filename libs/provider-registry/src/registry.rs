use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::traits::{Receiver, Sender};

/// Builder used to assemble a provider registration entry.
pub struct ProviderBuilder {
    key: String,
    sender: Option<Arc<dyn Sender>>,
    receiver: Option<Arc<dyn Receiver>>,
}

impl ProviderBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            sender: None,
            receiver: None,
        }
    }

    /// Registers an adapter exposing both capabilities under its own type key.
    pub fn full<P>(provider: Arc<P>) -> Self
    where
        P: Sender + Receiver + 'static,
    {
        let key = Sender::provider_type(provider.as_ref()).to_string();
        Self::new(key)
            .with_sender(provider.clone())
            .with_receiver(provider)
    }

    pub fn with_sender(mut self, sender: Arc<dyn Sender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_receiver(mut self, receiver: Arc<dyn Receiver>) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

struct ProviderEntry {
    sender: Option<Arc<dyn Sender>>,
    receiver: Option<Arc<dyn Receiver>>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("provider `{0}` already registered")]
    AlreadyRegistered(String),
    #[error("provider key must not be empty")]
    EmptyKey,
    #[error("provider `{0}` registers neither a sender nor a receiver")]
    NoCapabilities(String),
    #[error("provider `{key}` registered with an adapter reporting type `{reported}`")]
    KeyMismatch { key: String, reported: String },
}

/// Immutable map from provider type key to its adapter capabilities.
///
/// Built once at startup and shared behind an `Arc`; lookups need no locking.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: HashMap<String, ProviderEntry>,
    order: Vec<String>,
}

impl ProviderRegistry {
    /// Builds the registry from an ordered list of registrations.
    pub fn new<I>(builders: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = ProviderBuilder>,
    {
        let mut registry = Self::default();
        for builder in builders {
            registry.insert(builder)?;
        }
        Ok(registry)
    }

    fn insert(&mut self, builder: ProviderBuilder) -> Result<(), RegistryError> {
        let ProviderBuilder {
            key,
            sender,
            receiver,
        } = builder;
        if key.trim().is_empty() {
            return Err(RegistryError::EmptyKey);
        }
        if sender.is_none() && receiver.is_none() {
            return Err(RegistryError::NoCapabilities(key));
        }
        let reported = sender
            .as_ref()
            .map(|s| s.provider_type())
            .into_iter()
            .chain(receiver.as_ref().map(|r| r.provider_type()))
            .find(|reported| *reported != key);
        if let Some(reported) = reported {
            return Err(RegistryError::KeyMismatch {
                reported: reported.to_string(),
                key,
            });
        }
        if self.entries.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered(key));
        }
        debug!(
            provider = %key,
            sender = sender.is_some(),
            receiver = receiver.is_some(),
            "provider registered"
        );
        self.order.push(key.clone());
        self.entries.insert(key, ProviderEntry { sender, receiver });
        Ok(())
    }

    pub fn sender(&self, key: &str) -> Option<&Arc<dyn Sender>> {
        self.entries.get(key).and_then(|entry| entry.sender.as_ref())
    }

    pub fn receiver(&self, key: &str) -> Option<&Arc<dyn Receiver>> {
        self.entries
            .get(key)
            .and_then(|entry| entry.receiver.as_ref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Provider keys in registration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
