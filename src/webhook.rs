// ABOUTME: HTTP front door for Slack: Events API callbacks, interactivity, health and metrics
// ABOUTME: Verifies v0 request signatures and queues accepted events for the relay

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use hmac::{Hmac, Mac};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use slackord_core::{config::WebhookConfig, metrics, InboundEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::greeting::GreetAction;
use crate::platform::slack::events::{normalize, SlackEnvelope, SlackInbound};

const SIGNATURE_HEADER: &str = "x-slack-signature";
const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
const RETRY_HEADER: &str = "x-slack-retry-num";

/// Requests older (or newer) than this are treated as replays
const MAX_REQUEST_AGE_SECS: u64 = 5 * 60;

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub const HEALTH_TEXT: &str = "Slack and Discord bridges are running";

#[derive(Clone)]
pub struct WebhookState {
    /// Accepted Slack events, consumed by the bridge
    pub events: mpsc::Sender<InboundEvent>,
    /// Wave button clicks
    pub greetings: mpsc::Sender<GreetAction>,
    pub signing_secret: Arc<String>,
    /// Slack user id of the bridge bot
    pub bridge_user_id: String,
}

#[derive(Debug, Deserialize)]
struct InteractionForm {
    payload: String,
}

/// Verify a `v0=` Slack signature over `v0:{timestamp}:{body}`.
///
/// `now` is unix seconds; timestamps outside the five minute window fail.
pub fn verify_slack_signature(
    headers: &HeaderMap,
    body: &[u8],
    signing_secret: &str,
    now: i64,
) -> Result<()> {
    let timestamp = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .context("Missing X-Slack-Request-Timestamp")?;
    let sent_at: i64 = timestamp
        .parse()
        .with_context(|| format!("Invalid request timestamp `{}`", timestamp))?;
    if now.abs_diff(sent_at) > MAX_REQUEST_AGE_SECS {
        anyhow::bail!("Request timestamp {} outside the replay window", sent_at);
    }

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .context("Missing X-Slack-Signature")?;
    let digest = signature
        .strip_prefix("v0=")
        .context("Signature must use v0=<hex> format")?;
    let expected = hex::decode(digest).context("Signature is not valid hex")?;

    let mut mac = Hmac::<Sha256>::new_from_slice(signing_secret.as_bytes())
        .context("Failed to initialize HMAC verifier")?;
    mac.update(format!("v0:{}:", timestamp).as_bytes());
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| anyhow::anyhow!("Signature mismatch"))
}

/// Compute the `v0=` signature Slack would send for `body` at `timestamp`
pub fn sign_slack_request(signing_secret: &str, timestamp: i64, body: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(signing_secret.as_bytes())
        .context("Failed to initialize HMAC signer")?;
    mac.update(format!("v0:{}:", timestamp).as_bytes());
    mac.update(body);
    Ok(format!("v0={}", hex::encode(mac.finalize().into_bytes())))
}

/// Reject Slack requests whose signature does not verify. The body is
/// buffered for the check and handed on unchanged.
pub async fn slack_signature_middleware(
    State(state): State<WebhookState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE)?;

    let now = chrono::Utc::now().timestamp();
    if let Err(e) = verify_slack_signature(&parts.headers, &bytes, &state.signing_secret, now) {
        tracing::warn!(path = %parts.uri.path(), error = %e, "Rejected Slack request");
        metrics::record_error("slack_signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

/// Build the front door router
pub fn router(state: WebhookState, metrics_handle: PrometheusHandle) -> Router {
    let slack_routes = Router::new()
        .route("/slack/events", post(events_handler))
        .route("/slack/interactions", post(interactions_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            slack_signature_middleware,
        ))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::new(metrics_handle));

    Router::new()
        .route("/", get(|| async { HEALTH_TEXT }))
        .merge(slack_routes)
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
}

/// Serve the router until `cancel` fires
pub async fn start_webhook_server(
    config: &WebhookConfig,
    state: WebhookState,
    metrics_handle: PrometheusHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let app = router(state, metrics_handle);
    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(addr = %addr, "Starting Slack webhook server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind webhook server to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Webhook server failed")?;
    Ok(())
}

async fn events_handler(State(state): State<WebhookState>, headers: HeaderMap, body: Bytes) -> Response {
    let envelope: SlackEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable Slack event body");
            return (StatusCode::BAD_REQUEST, "invalid JSON").into_response();
        }
    };

    if envelope.is_url_verification() {
        tracing::info!("Answering Slack URL verification");
        return Json(json!({ "challenge": envelope.challenge.unwrap_or_default() })).into_response();
    }

    if let Some(retry) = headers.get(RETRY_HEADER).and_then(|v| v.to_str().ok()) {
        tracing::debug!(
            retry = %retry,
            event_id = ?envelope.event_id,
            "Slack redelivery"
        );
    }

    if envelope.is_foreign_bot(&state.bridge_user_id) {
        tracing::debug!(event_id = ?envelope.event_id, "Ignoring bot-authored Slack event");
        return Json(json!({ "status": "ignored" })).into_response();
    }

    match normalize(&envelope) {
        SlackInbound::Event(event) => {
            tracing::info!(
                event_id = %event.dedup_key,
                channel = %event.channel_id,
                author = %event.author.id,
                preview = %event.preview(),
                "Slack event accepted"
            );
            if state.events.send(*event).await.is_err() {
                tracing::error!("Relay queue closed, dropping Slack event");
                return (StatusCode::SERVICE_UNAVAILABLE, "relay unavailable").into_response();
            }
            Json(json!({ "status": "processing" })).into_response()
        }
        SlackInbound::Skipped(reason) => {
            tracing::debug!(reason, event_id = ?envelope.event_id, "Slack event skipped");
            Json(json!({ "status": "ignored" })).into_response()
        }
    }
}

async fn interactions_handler(
    State(state): State<WebhookState>,
    Form(form): Form<InteractionForm>,
) -> Response {
    let payload: Value = match serde_json::from_str(&form.payload) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "Slack interaction payload is not JSON");
            return (StatusCode::BAD_REQUEST, "invalid payload").into_response();
        }
    };

    match GreetAction::from_payload(&payload) {
        Some(action) => {
            tracing::info!(
                slack_user = %action.slack_user_id,
                discord_user = %action.discord_user_id,
                "Wave button clicked"
            );
            if state.greetings.send(action).await.is_err() {
                tracing::error!("Greeting queue closed, dropping wave");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        }
        None => tracing::debug!("Ignoring unrelated Slack interaction"),
    }
    StatusCode::OK.into_response()
}

async fn metrics_handler(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_headers(secret: &str, timestamp: i64, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, timestamp.to_string().parse().unwrap());
        headers.insert(
            SIGNATURE_HEADER,
            sign_slack_request(secret, timestamp, body).unwrap().parse().unwrap(),
        );
        headers
    }

    #[test]
    fn test_valid_signature_accepted() {
        let body = br#"{"type":"event_callback"}"#;
        let headers = signed_headers("s3cret", 1_700_000_000, body);
        assert!(verify_slack_signature(&headers, body, "s3cret", 1_700_000_010).is_ok());
    }

    #[test]
    fn test_known_slack_vector() {
        // Example from Slack's request-verification docs
        let secret = "8f742231b10e8888abcd99yyyzzz85a5";
        let body = b"token=xyzz0WbapA4vBCDEFasx0q6G&team_id=T1DC2JH3J&team_domain=testteamnow&channel_id=G8PSS9T3V&channel_name=foobar&user_id=U2CERLKJA&user_name=roadrunner&command=%2Fwebhook-collect&text=&response_url=https%3A%2F%2Fhooks.slack.com%2Fcommands%2FT1DC2JH3J%2F397700885554%2F96rGlfmibIGlgcZRskXaIFfN&trigger_id=398738663015.47445629121.803a0bc887a14d10d2c447fce8b6703c";
        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, "1531420618".parse().unwrap());
        headers.insert(
            SIGNATURE_HEADER,
            "v0=a2114d57b48eac39b9ad189dd8316235a7b4a8d21a10bd27519666489c69b503"
                .parse()
                .unwrap(),
        );
        assert!(verify_slack_signature(&headers, body, secret, 1_531_420_618).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let headers = signed_headers("s3cret", 1_700_000_000, b"original");
        assert!(verify_slack_signature(&headers, b"tampered", "s3cret", 1_700_000_000).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let body = b"{}";
        let headers = signed_headers("s3cret", 1_700_000_000, body);
        let six_minutes_later = 1_700_000_000 + 6 * 60;
        assert!(verify_slack_signature(&headers, body, "s3cret", six_minutes_later).is_err());
    }

    #[test]
    fn test_missing_headers_rejected() {
        assert!(verify_slack_signature(&HeaderMap::new(), b"{}", "s3cret", 0).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, "100".parse().unwrap());
        headers.insert(SIGNATURE_HEADER, "sha256=abcd".parse().unwrap());
        assert!(verify_slack_signature(&headers, b"{}", "s3cret", 100).is_err());
    }
}
