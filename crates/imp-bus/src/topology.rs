//! Subscriber topology descriptors.

use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Topic,
    Fanout,
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Direct => "direct",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeConfig {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeConfig {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

/// Full subscription topology: exchange, queue, binding and queue lifetime flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriberConfig {
    /// Not part of the subject on core NATS.
    pub exchange: ExchangeConfig,
    pub queue: String,
    pub binding: String,
    /// Queue used only by the declaring connection.
    pub exclusive_queue: bool,
    /// Queue deleted when its last consumer disconnects.
    pub auto_delete_queue: bool,
    /// Queue survives a broker restart.
    pub durable_queue: bool,
    /// Single consumer per channel.
    pub exclusive_consumer: bool,
}

impl SubscriberConfig {
    /// Per-node ephemeral queue: every live instance receives its own copy of
    /// each matching message.
    pub fn fan_out(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        binding: impl Into<String>,
    ) -> Self {
        Self {
            exchange: ExchangeConfig::topic(exchange),
            queue: queue.into(),
            binding: binding.into(),
            exclusive_queue: true,
            auto_delete_queue: true,
            durable_queue: false,
            exclusive_consumer: true,
        }
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.queue.trim().is_empty() {
            return Err(TopologyError::MissingQueue);
        }
        if self.binding.trim().is_empty() {
            return Err(TopologyError::MissingBinding(self.queue.clone()));
        }
        if self.exchange.name.trim().is_empty() {
            return Err(TopologyError::MissingExchange(self.queue.clone()));
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("subscriber queue name must not be empty")]
    MissingQueue,
    #[error("queue `{0}` has no binding pattern")]
    MissingBinding(String),
    #[error("queue `{0}` has no exchange")]
    MissingExchange(String),
    #[error("queue `{0}` is exclusive to another consumer")]
    QueueInUse(String),
    #[error("transport does not support {0}")]
    Unsupported(String),
}

/// Topic-pattern match: `*` matches one segment, `#` or `>` match the remaining
/// segments (at least one).
///
/// ```
/// use imp_bus::topic_matches;
///
/// assert!(topic_matches(
///     "im_provider.outbound.*.send.text.v1",
///     "im_provider.outbound.5.send.text.v1"
/// ));
/// assert!(!topic_matches(
///     "im_provider.outbound.*.send.text.v1",
///     "im_provider.outbound.5.send.image.v1"
/// ));
/// ```
pub fn topic_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some("#") | Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
