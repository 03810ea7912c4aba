type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Whether another attempt at the same call may succeed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    Transient,
    Permanent,
}

/// Failure reported by a provider adapter.
///
/// `code` is machine readable and is copied into dead-letter records.
#[derive(thiserror::Error, Debug)]
#[error("{code}: {message}")]
pub struct ProviderError {
    code: String,
    message: String,
    class: RetryClass,
    #[source]
    cause: Option<BoxError>,
}

impl ProviderError {
    fn build(class: RetryClass, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            class,
            cause: None,
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(RetryClass::Permanent, code, message)
    }

    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(RetryClass::Transient, code, message)
    }

    pub fn caused_by(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn class(&self) -> RetryClass {
        self.class
    }

    pub fn is_retryable(&self) -> bool {
        self.class == RetryClass::Transient
    }
}

/// Unclassified adapter failures are assumed transient.
impl From<anyhow::Error> for ProviderError {
    fn from(err: anyhow::Error) -> Self {
        ProviderError::retryable("internal_error", format!("{err:#}")).caused_by(err)
    }
}
