//! Helpdesk presence probing and the health endpoints.
//!
//! A cheap authenticated round trip runs on an interval. Presence flips to
//! down only after a configured number of consecutive failures, and each
//! edge (down, recovered) is announced exactly once in the broadcast
//! channel. `/healthz` reports process liveness; `/readyz` makes a live
//! round trip so load balancers see reachability, not a cached flag.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tracing::{error, info, warn};

use crate::chat::{ChatApi, MessagePayload};
use crate::helpdesk::HelpdeskApi;

pub struct PresenceMonitor {
    helpdesk: Arc<dyn HelpdeskApi>,
    chat: Arc<dyn ChatApi>,
    broadcast_channel_id: Option<u64>,
    failure_threshold: u32,
    consecutive_failures: AtomicU32,
    down: AtomicBool,
}

impl PresenceMonitor {
    pub fn new(
        helpdesk: Arc<dyn HelpdeskApi>,
        chat: Arc<dyn ChatApi>,
        broadcast_channel_id: Option<u64>,
        failure_threshold: u32,
    ) -> Self {
        Self {
            helpdesk,
            chat,
            broadcast_channel_id,
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
            down: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }

    /// Live bounded-timeout round trip, for the readiness endpoint.
    pub async fn check_remote(&self) -> bool {
        self.helpdesk.probe().await.is_ok()
    }

    /// One probe round trip, updating the presence edge.
    pub async fn probe_once(&self) {
        match self.helpdesk.probe().await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                if self.down.swap(false, Ordering::SeqCst) {
                    info!("helpdesk reachable again");
                    self.broadcast("✅ Helpdesk connection restored.").await;
                }
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(failures, "helpdesk probe failed: {err}");
                if failures >= self.failure_threshold && !self.down.swap(true, Ordering::SeqCst) {
                    error!(failures, "helpdesk marked down");
                    self.broadcast(
                        "⚠️ Helpdesk is unreachable; ticket sync may lag until it recovers.",
                    )
                    .await;
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.probe_once().await;
        }
    }

    async fn broadcast(&self, text: &str) {
        let Some(channel_id) = self.broadcast_channel_id else {
            return;
        };
        if let Err(err) = self
            .chat
            .post_message(channel_id, &MessagePayload::text(text), &[])
            .await
        {
            // The chat side may be struggling too; the edge is already logged.
            error!("presence broadcast failed: {err}");
        }
    }
}

pub fn router(monitor: Arc<PresenceMonitor>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(monitor)
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn readyz(State(monitor): State<Arc<PresenceMonitor>>) -> (StatusCode, &'static str) {
    if monitor.check_remote().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "helpdesk unreachable")
    }
}
