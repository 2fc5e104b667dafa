//! Discord Gateway client: locally authored thread messages flow from here
//! to the helpdesk.
//!
//! The handler only reacts to human messages inside channels that map to a
//! ticket thread; everything else on the gateway is ignored. Bot-authored
//! messages never enter the pipeline, which is what keeps replicated
//! articles from echoing back as new articles.

use std::sync::Arc;

use serenity::all::{Context, EventHandler, GatewayIntents, Message, Ready};
use serenity::async_trait;
use serenity::Client;
use tracing::{debug, error, info};

use crate::queue::TicketQueues;
use crate::reconcile::SyncEngine;
use crate::replicate::{LocalAttachment, LocalMessage};
use crate::store::BridgeStore;
use crate::BridgeError;

/// Shared state for the gateway event handler.
#[derive(Clone)]
pub struct GatewayState {
    pub store: BridgeStore,
    pub queues: TicketQueues,
    pub engine: Arc<SyncEngine>,
}

/// Route one thread message to the helpdesk, behind the ticket's queue.
/// Messages in channels with no ticket mapping are dropped silently.
pub async fn handle_thread_message(
    state: &GatewayState,
    thread_channel_id: u64,
    message: LocalMessage,
) -> Result<bool, BridgeError> {
    let Some(thread) = state.store.thread_by_thread_id(thread_channel_id)? else {
        debug!(thread_channel_id, "message in unmapped channel ignored");
        return Ok(false);
    };

    let ticket_id = thread.ticket_id;
    let engine = state.engine.clone();
    state
        .queues
        .run(ticket_id, async move {
            engine.replicator().sync_local_message(&thread, &message).await
        })
        .await?;
    Ok(true)
}

pub struct GatewayHandler {
    state: GatewayState,
}

impl GatewayHandler {
    pub fn new(state: GatewayState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl EventHandler for GatewayHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("gateway connected as {}", ready.user.name);
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        // Thread messages arrive with the thread's id as channel id.
        let thread_channel_id = msg.channel_id.get();
        let local = LocalMessage {
            id: msg.id.get(),
            author_id: msg.author.id.get(),
            author_name: msg.author.name.clone(),
            content: msg.content.clone(),
            attachments: msg
                .attachments
                .iter()
                .map(|a| LocalAttachment {
                    filename: a.filename.clone(),
                    url: a.url.clone(),
                    size: Some(a.size as u64),
                    content_type: a.content_type.clone(),
                })
                .collect(),
        };

        match handle_thread_message(&self.state, thread_channel_id, local).await {
            Ok(true) => debug!(
                message_id = msg.id.get(),
                thread_channel_id, "thread message replicated"
            ),
            Ok(false) => {}
            Err(err) => error!(
                message_id = msg.id.get(),
                thread_channel_id, "thread message replication failed: {err}"
            ),
        }
    }
}

/// Create and start the Gateway connection. Spawn as a background task; it
/// only returns on a connection error.
pub async fn start_gateway_client(
    token: &str,
    state: GatewayState,
) -> Result<(), serenity::Error> {
    let intents = GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(token, intents)
        .event_handler(GatewayHandler::new(state))
        .await?;

    info!("starting gateway client");
    client.start().await
}
