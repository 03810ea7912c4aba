//! Terminal dispatch failures and where they are sent.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use imp_bus::{BusClient, BusError, DeadLetterError, DeadLetterRecord};
use imp_core::Operation;
use tracing::{Span, info};

/// A command the dispatcher gave up on.
#[derive(Debug, Clone)]
pub struct TerminalFailure {
    pub operation: Operation,
    pub provider: Option<String>,
    pub routing_key: String,
    pub msg_id: String,
    pub attempts: u32,
    pub code: String,
    pub reason: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait FailureSink: Send + Sync {
    async fn dead_letter(&self, failure: &TerminalFailure) -> Result<(), BusError>;
}

/// Publishes [`DeadLetterRecord`]s to `dlq.im_provider.<kind>`.
pub struct BusFailureSink {
    bus: Arc<dyn BusClient>,
    span: Span,
}

impl BusFailureSink {
    pub fn new(bus: Arc<dyn BusClient>, span: Span) -> Self {
        Self { bus, span }
    }
}

#[async_trait]
impl FailureSink for BusFailureSink {
    async fn dead_letter(&self, failure: &TerminalFailure) -> Result<(), BusError> {
        let mut record = DeadLetterRecord::new(
            failure.operation.name(),
            failure.routing_key.clone(),
            failure.msg_id.clone(),
            DeadLetterError {
                code: failure.code.clone(),
                message: failure.reason.clone(),
            },
            &failure.payload,
        )
        .with_attempts(failure.attempts);
        if let Some(provider) = &failure.provider {
            record = record.with_provider(provider.clone());
        }
        let subject = failure.operation.dead_letter_subject();
        record.publish(self.bus.as_ref(), &subject).await?;
        self.span.in_scope(|| {
            info!(
                subject = %subject,
                msg_id = %failure.msg_id,
                attempts = failure.attempts,
                "command dead-lettered"
            )
        });
        Ok(())
    }
}
