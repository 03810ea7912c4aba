use std::time::Duration;

/// Outcome classification returned by a single call attempt.
#[derive(thiserror::Error, Debug)]
pub enum CallError {
    /// Transport or availability failure: retried and counted by the breaker.
    #[error("transient: {0}")]
    Transient(#[source] anyhow::Error),
    /// The target answered with a failure of its own: never retried or counted.
    #[error("application error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Application {
        status: Option<u16>,
        message: String,
    },
}

impl CallError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        CallError::Transient(err.into())
    }

    pub fn application(status: Option<u16>, message: impl Into<String>) -> Self {
        CallError::Application {
            status,
            message: message.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
    #[error("no live endpoints for `{0}`")]
    NoEndpoints(String),
    #[error("lookup of `{service}` failed: {source}")]
    Lookup {
        service: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("circuit breaker open for `{target}`")]
    BreakerOpen { target: String },
    #[error("`{target}` unavailable after {attempts} attempt(s): {source}")]
    Transient {
        target: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("application error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Application {
        status: Option<u16>,
        message: String,
    },
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RpcError {
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, RpcError::BreakerOpen { .. })
    }

    /// Whether a caller may reasonably try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::BreakerOpen { .. } | RpcError::Transient { .. } | RpcError::Discovery(_)
        )
    }
}

#[derive(thiserror::Error, Debug)]
#[error("call timed out after {0:?}")]
pub struct CallTimeout(pub Duration);
