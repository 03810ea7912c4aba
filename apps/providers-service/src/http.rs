//! Webhook ingress: `POST /wh/{provider}` hands the raw body to the
//! provider's receiver.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    debug_handler,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use imp_provider_registry::ProviderRegistry;
use metrics::counter;
use tracing::{Instrument, Span, debug, error, info_span, warn};

/// Largest webhook body accepted before the request is rejected.
pub const MAX_WEBHOOK_BODY: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct WebhookState {
    pub registry: Arc<ProviderRegistry>,
    pub span: Span,
}

pub fn build_router(state: WebhookState) -> Router {
    Router::new()
        .route("/wh/{provider}", post(webhook))
        .route("/healthz", get(healthz))
        .layer(Extension(Arc::new(state)))
}

async fn healthz() -> &'static str {
    "ok"
}

#[debug_handler]
async fn webhook(
    Path(provider): Path<String>,
    Extension(state): Extension<Arc<WebhookState>>,
    body: Body,
) -> Response {
    let span = info_span!(parent: &state.span, "webhook", provider = %provider);
    async move {
        let (status, response) = handle_webhook(&state, &provider, body).await;
        // Unregistered names stay out of the metric labels.
        let label = if status == StatusCode::NOT_FOUND {
            "unknown".to_string()
        } else {
            provider
        };
        counter!("imp_webhook_total", "provider" => label, "status" => status.as_str().to_string())
            .increment(1);
        response
    }
    .instrument(span)
    .await
}

async fn handle_webhook(state: &WebhookState, provider: &str, body: Body) -> (StatusCode, Response) {
    let Some(receiver) = state.registry.receiver(provider) else {
        warn!("webhook for unregistered provider");
        return reply(StatusCode::NOT_FOUND, "provider not found");
    };

    let payload = match axum::body::to_bytes(body, MAX_WEBHOOK_BODY).await {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to read webhook body");
            return reply(StatusCode::BAD_REQUEST, "invalid request body");
        }
    };

    let size = payload.len();
    match receiver.handle_webhook(payload).await {
        Ok(()) => {
            debug!(size, "webhook handled");
            (StatusCode::OK, StatusCode::OK.into_response())
        }
        Err(err) => {
            error!(error = %err, "webhook handler failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn reply(status: StatusCode, text: impl Into<String>) -> (StatusCode, Response) {
    (status, (status, text.into()).into_response())
}
