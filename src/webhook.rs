//! Inbound webhook endpoint.
//!
//! The helpdesk posts ticket events here. Each request is authenticated by
//! an HMAC-SHA1 signature over the raw body, deduplicated by delivery id,
//! acknowledged immediately, and processed behind the ticket's queue. A
//! delivery whose processing fails is released from the dedup ledger so the
//! sender's retry is accepted.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use tracing::{error, info, warn};

use crate::queue::TicketQueues;
use crate::reconcile::SyncEngine;
use crate::store::BridgeStore;

pub const DELIVERY_HEADER: &str = "x-helpdesk-delivery";
pub const SIGNATURE_HEADER: &str = "x-hub-signature";

type HmacSha1 = Hmac<Sha1>;

/// Constant-time check of `sha1=<hex>` against the raw request body.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.trim().strip_prefix("sha1=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    ticket: TicketRef,
    #[serde(default)]
    article: Option<ArticleRef>,
}

#[derive(Debug, Deserialize)]
struct TicketRef {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct ArticleRef {
    id: u64,
}

#[derive(Clone)]
pub struct WebhookState {
    pub store: BridgeStore,
    pub queues: TicketQueues,
    pub engine: Arc<SyncEngine>,
    pub secret: String,
}

pub fn router(state: WebhookState, body_max_bytes: usize) -> Router {
    Router::new()
        .route("/webhook/helpdesk", post(handle_webhook))
        .layer(DefaultBodyLimit::max(body_max_bytes))
        .with_state(state)
}

async fn handle_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let Some(delivery_id) = header_str(&headers, DELIVERY_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing delivery id");
    };
    let Some(signature) = header_str(&headers, SIGNATURE_HEADER) else {
        warn!(delivery_id, "webhook without signature rejected");
        return (StatusCode::UNAUTHORIZED, "missing signature");
    };
    if !verify_signature(&state.secret, &body, signature) {
        warn!(delivery_id, "webhook signature mismatch");
        return (StatusCode::UNAUTHORIZED, "bad signature");
    }

    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            warn!(delivery_id, "unparseable webhook body: {err}");
            return (StatusCode::BAD_REQUEST, "bad payload");
        }
    };

    // Dedup before dispatch: a redelivery of an in-flight or finished
    // delivery id is acknowledged without doing anything.
    match state.store.insert_delivery(delivery_id) {
        Ok(true) => {}
        Ok(false) => {
            info!(delivery_id, "duplicate delivery acknowledged");
            return (StatusCode::OK, "duplicate");
        }
        Err(err) => {
            error!(delivery_id, "delivery ledger write failed: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "ledger unavailable");
        }
    }

    let ticket_id = event.ticket.id;
    let delivery_id = delivery_id.to_string();
    info!(
        ticket_id,
        delivery_id = %delivery_id,
        article_id = ?event.article.as_ref().map(|a| a.id),
        "webhook accepted"
    );

    // Ack now, process behind the ticket's queue.
    let engine = state.engine.clone();
    let queues = state.queues.clone();
    let store = state.store.clone();
    tokio::spawn(async move {
        let outcome = queues
            .run(ticket_id, async move { engine.sync_ticket(ticket_id).await })
            .await;
        if let Err(err) = outcome {
            error!(ticket_id, "webhook processing failed: {err}");
            // Release the delivery id so the sender's retry gets through.
            if let Err(err) = store.remove_delivery(&delivery_id) {
                error!(delivery_id = %delivery_id, "delivery release failed: {err}");
            }
        }
    });

    (StatusCode::ACCEPTED, "accepted")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
