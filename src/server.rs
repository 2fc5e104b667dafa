//! Service wiring: construct the stores and clients, start the background
//! loops, and serve the HTTP surface until shutdown.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use tracing::{error, info};

use crate::chat::DiscordRest;
use crate::config::{AttachmentLimitsHandle, BridgeConfig};
use crate::gateway::{start_gateway_client, GatewayState};
use crate::helpdesk::HttpHelpdesk;
use crate::lifecycle::{LifecycleManager, StateMap};
use crate::presence::{self, PresenceMonitor};
use crate::queue::{EgressLimiter, TicketQueues};
use crate::reconcile::{Reconciler, SyncEngine};
use crate::replicate::Replicator;
use crate::store::BridgeStore;
use crate::webhook::{self, WebhookState};
use crate::BridgeError;

pub async fn run_server(
    config: BridgeConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BridgeError> {
    let store = BridgeStore::new(&config.db_path)?;

    let egress = Arc::new(EgressLimiter::new(
        config.egress_max_concurrency,
        config.egress_max_per_second,
    ));
    let chat = Arc::new(DiscordRest::new(
        &config.discord_bot_token,
        config.discord_guild_id,
        config.http_timeout,
        egress,
    )?);
    let helpdesk = Arc::new(HttpHelpdesk::new(
        &config.helpdesk_base_url,
        &config.helpdesk_api_token,
        config.http_timeout,
    )?);

    let states = StateMap::new(
        config.hidden_states.clone(),
        config.hidden_archive_states.clone(),
        config.closed_states.clone(),
    );
    let lifecycle = LifecycleManager::new(
        store.clone(),
        chat.clone(),
        helpdesk.clone(),
        states,
        config.discord_channel_id,
        config.member_role_ids.clone(),
    );
    let limits = Arc::new(AttachmentLimitsHandle::new(config.attachment_limits.clone()));
    let replicator = Replicator::new(store.clone(), chat.clone(), helpdesk.clone(), limits);
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        helpdesk.clone(),
        lifecycle,
        replicator,
    ));
    let queues = TicketQueues::new();

    let reconciler = Arc::new(Reconciler::new(
        engine.clone(),
        store.clone(),
        helpdesk.clone(),
        queues.clone(),
        config.close_grace,
        config.reopen_grace,
        config.article_catchup_interval,
        config.closed_states.clone(),
    ));
    let reconcile_task = tokio::spawn(reconciler.run(config.reconcile_interval));

    let monitor = Arc::new(PresenceMonitor::new(
        helpdesk.clone(),
        chat.clone(),
        config.broadcast_channel_id,
        config.probe_failure_threshold,
    ));
    let presence_task = tokio::spawn(monitor.clone().run(config.probe_interval));

    let gateway_state = GatewayState {
        store: store.clone(),
        queues: queues.clone(),
        engine: engine.clone(),
    };
    let bot_token = config.discord_bot_token.clone();
    let gateway_task = tokio::spawn(async move {
        if let Err(err) = start_gateway_client(&bot_token, gateway_state).await {
            error!("gateway client exited: {err}");
        }
    });

    let app = Router::new()
        .merge(webhook::router(
            WebhookState {
                store,
                queues,
                engine,
                secret: config.webhook_secret.clone(),
            },
            config.body_max_bytes,
        ))
        .merge(presence::router(monitor));

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| BridgeError::Config(format!("invalid host: {}", config.host)))?;
    let addr = SocketAddr::new(host, config.port);
    info!("deskbridge listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| BridgeError::Other(format!("bind {addr}: {err}")))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| BridgeError::Other(format!("server error: {err}")))?;

    // Listener is drained; stop the timer loops and drop the gateway
    // connection. Every durable write is a single sqlite call, so an
    // aborted pass leaves nothing half-applied.
    reconcile_task.abort();
    presence_task.abort();
    gateway_task.abort();
    info!("deskbridge stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn shutdown_stops_background_loops() {
        let dir = TempDir::new().expect("tempdir");
        let config = BridgeConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            body_max_bytes: 1024,
            helpdesk_base_url: "http://127.0.0.1:9".to_string(),
            helpdesk_api_token: "token".to_string(),
            webhook_secret: "secret".to_string(),
            discord_bot_token: "bot".to_string(),
            discord_guild_id: 1,
            discord_channel_id: 2,
            broadcast_channel_id: None,
            member_role_ids: Vec::new(),
            db_path: dir.path().join("bridge.db"),
            http_timeout: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(60),
            article_catchup_interval: Duration::from_secs(300),
            probe_interval: Duration::from_secs(60),
            probe_failure_threshold: 3,
            close_grace: Duration::from_secs(300),
            reopen_grace: Duration::from_secs(120),
            hidden_states: vec!["pending reminder".to_string()],
            hidden_archive_states: vec!["pending close".to_string()],
            closed_states: vec!["closed".to_string()],
            egress_max_concurrency: 2,
            egress_max_per_second: 10,
            attachment_limits: Default::default(),
        };

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(run_server(config, async move {
            let _ = rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).expect("signal shutdown");

        // The whole process must come down promptly, background loops
        // included, not only the HTTP listener.
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("shutdown in time")
            .expect("join");
        assert!(result.is_ok());
    }
}
