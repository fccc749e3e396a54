//! HTTP surface: inbound relay endpoint, manual reprocessing, the receipt
//! ledger and health.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{ActionError, Error, InvokeError, RouteError, StoreError};
use crate::invoker::{ProcessorInvoker, ReceiptLedger};
use crate::pipeline::{InboundMail, MailRelay, RouteOutcome};

/// Header carrying the envelope recipient.
pub const RECIPIENT_HEADER: &str = "x-recipient";
/// Optional header carrying the upstream relay's message id.
pub const MESSAGE_ID_HEADER: &str = "x-relay-message-id";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<MailRelay>,
    pub invoker: Arc<ProcessorInvoker>,
    pub ledger: ReceiptLedger,
}

/// Build the Axum router.
///
/// `max_message_bytes` replaces Axum's 2 MiB default body limit; a raw message
/// with a few scanned receipts attached is routinely larger than that.
pub fn intake_routes(
    relay: Arc<MailRelay>,
    invoker: Arc<ProcessorInvoker>,
    ledger: ReceiptLedger,
    max_message_bytes: usize,
) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/inbound", post(inbound))
        .route("/reprocess/{id}", post(reprocess))
        .route("/ledger", get(ledger_csv))
        .layer(DefaultBodyLimit::max(max_message_bytes))
        .with_state(AppState {
            relay,
            invoker,
            ledger,
        })
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let limits = state.invoker.limits();
    Json(json!({
        "status": "ok",
        "service": "receipt-intake",
        "recipients": state.relay.router().recipients(),
        "invoker": state.invoker.stats(),
        "limits": {
            "concurrency": limits.concurrency,
            "timeoutSecs": limits.timeout.as_secs(),
            "memoryMb": limits.memory_mb,
        },
    }))
}

// ── Inbound ─────────────────────────────────────────────────────────────

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn throttled(retry_after: Duration, body: serde_json::Value) -> Response {
    let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, secs.to_string())],
        Json(body),
    )
        .into_response()
}

fn outcome_body(outcome: &RouteOutcome) -> serde_json::Value {
    json!({
        "messageId": outcome.message_id,
        "rule": outcome.rule,
        "artifact": outcome.artifact(),
        "invocation": outcome.invocation(),
        "error": outcome.failure().map(|(action, e)| json!({
            "action": action,
            "message": e.to_string(),
        })),
    })
}

async fn inbound(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(recipient) = header_str(&headers, RECIPIENT_HEADER) else {
        return error_body(StatusCode::BAD_REQUEST, format!("Missing {RECIPIENT_HEADER} header"));
    };

    let mail = InboundMail {
        recipient: recipient.to_string(),
        raw: body.to_vec(),
        relay_message_id: header_str(&headers, MESSAGE_ID_HEADER).map(str::to_string),
    };

    let outcome = match state.relay.accept(mail).await {
        Ok(outcome) => outcome,
        Err(e @ RouteError::NoMatchingRule { .. }) => {
            return error_body(StatusCode::UNPROCESSABLE_ENTITY, e.to_string());
        }
        Err(e @ RouteError::InvalidMessageId { .. }) => {
            return error_body(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    let body = outcome_body(&outcome);
    match outcome.failure() {
        None => (StatusCode::ACCEPTED, Json(body)).into_response(),
        Some((_, ActionError::StoreWriteFailure(_))) => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
        Some((_, ActionError::Invoke(e))) if e.is_retryable() => {
            throttled(e.retry_after().unwrap_or(Duration::from_secs(1)), body)
        }
        Some((_, ActionError::Invoke(InvokeError::AccessDenied(_))))
        | Some((_, ActionError::MissingArtifact { .. })) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
        // Stored; processing failed and is left for reprocessing.
        Some((_, ActionError::Invoke(_))) => (StatusCode::ACCEPTED, Json(body)).into_response(),
    }
}

// ── Reprocess ───────────────────────────────────────────────────────────

async fn reprocess(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    debug!(message_id = %id, "Reprocess requested");
    match state.relay.reprocess(&id).await {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))).into_response(),
        Err(Error::Route(e)) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
        Err(Error::Store(StoreError::NotFound { key })) => {
            error_body(StatusCode::NOT_FOUND, format!("No stored message at {key}"))
        }
        Err(Error::Invoke(e)) if e.is_retryable() => throttled(
            e.retry_after().unwrap_or(Duration::from_secs(1)),
            json!({ "error": e.to_string() }),
        ),
        Err(Error::Invoke(e @ (InvokeError::Timeout { .. } | InvokeError::Failed { .. }))) => {
            error_body(StatusCode::BAD_GATEWAY, e.to_string())
        }
        Err(e) => {
            warn!(message_id = %id, error = %e, "Reprocess failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── Ledger ──────────────────────────────────────────────────────────────

async fn ledger_csv(State(state): State<AppState>) -> Response {
    match state.ledger.to_csv().await {
        Ok(csv) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            csv,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Ledger read failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
