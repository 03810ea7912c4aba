//! Resilient client: discovery, circuit breaking and retry around a stub.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, Span, error, warn};

use crate::breaker::{BreakerRegistry, BreakerSettings};
use crate::discovery::{Discovery, Endpoint};
use crate::error::{CallError, CallTimeout, RpcError};
use crate::retry::RetryPolicy;

#[derive(Clone, Debug)]
pub struct RpcSettings {
    pub retry: RetryPolicy,
    pub breaker: BreakerSettings,
    /// Upper bound for a single attempt.
    pub call_timeout: Duration,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: BreakerSettings::default(),
            call_timeout: Duration::from_secs(10),
        }
    }
}

type Factory<T> = Arc<dyn Fn(&Endpoint) -> T + Send + Sync>;

/// Runs operations against a stub of type `T` built for a resolved endpoint.
pub struct ResilientClient<T> {
    service: String,
    discovery: Arc<dyn Discovery>,
    factory: Factory<T>,
    breakers: BreakerRegistry,
    retry: RetryPolicy,
    call_timeout: Duration,
    span: Span,
}

impl<T> Clone for ResilientClient<T> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            discovery: Arc::clone(&self.discovery),
            factory: Arc::clone(&self.factory),
            breakers: self.breakers.clone(),
            retry: self.retry.clone(),
            call_timeout: self.call_timeout,
            span: self.span.clone(),
        }
    }
}

impl<T: Send + 'static> ResilientClient<T> {
    /// `breakers` may be shared between clients; breakers are keyed by service.
    pub fn new<F>(
        service: impl Into<String>,
        discovery: Arc<dyn Discovery>,
        breakers: BreakerRegistry,
        settings: &RpcSettings,
        span: Span,
        factory: F,
    ) -> Self
    where
        F: Fn(&Endpoint) -> T + Send + Sync + 'static,
    {
        Self {
            service: service.into(),
            discovery,
            factory: Arc::new(factory),
            breakers,
            retry: settings.retry.clone(),
            call_timeout: settings.call_timeout,
            span,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Executes `op`, retrying transient failures with backoff. An open
    /// breaker fails fast and stops further attempts.
    pub async fn execute<R, F, Fut>(&self, op: F) -> Result<R, RpcError>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, CallError>>,
    {
        let span = self.span.clone();
        self.run(op).instrument(span).await
    }

    async fn run<R, F, Fut>(&self, op: F) -> Result<R, RpcError>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, CallError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            // An open breaker must not reach discovery either.
            let Some(permit) = self.breakers.acquire(&self.service) else {
                return Err(RpcError::BreakerOpen {
                    target: self.service.clone(),
                });
            };
            let endpoints = self.discovery.resolve(&self.service).await?;
            let Some(endpoint) = endpoints.first() else {
                return Err(RpcError::Discovery(
                    crate::error::DiscoveryError::NoEndpoints(self.service.clone()),
                ));
            };

            let stub = (self.factory)(endpoint);
            let outcome = match tokio::time::timeout(self.call_timeout, op(stub)).await {
                Ok(result) => result,
                Err(_) => Err(CallError::transient(CallTimeout(self.call_timeout))),
            };

            match outcome {
                Ok(value) => {
                    permit.succeed();
                    return Ok(value);
                }
                Err(CallError::Application { status, message }) => {
                    permit.succeed();
                    return Err(RpcError::Application { status, message });
                }
                Err(CallError::Transient(source)) => {
                    permit.fail();
                    if attempt >= max_attempts {
                        error!(attempt, service = %self.service, %endpoint, error = %source, "rpc call failed");
                        return Err(RpcError::Transient {
                            target: self.service.clone(),
                            attempts: attempt,
                            source,
                        });
                    }
                    let delay = self.retry.backoff(attempt);
                    warn!(attempt, service = %self.service, %endpoint, error = %source, ?delay, "retrying rpc call");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
