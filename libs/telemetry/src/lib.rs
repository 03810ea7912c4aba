//! Tracing setup shared by the service binaries.

mod config;
mod tracing_init;

pub use config::LogSettings;
pub use tracing_init::{TelemetryGuard, install};

use tracing::Span;

/// Records the message identifiers on a span declared with empty
/// `provider` and `msg_id` fields.
pub fn with_message_fields(span: &Span, provider: Option<&str>, msg_id: &str) {
    if let Some(provider) = provider {
        span.record("provider", tracing::field::display(provider));
    }
    span.record("msg_id", tracing::field::display(msg_id));
}
