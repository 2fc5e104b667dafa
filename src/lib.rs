pub mod cache;
pub mod chat;
pub mod config;
pub mod gateway;
pub mod helpdesk;
pub mod html;
pub mod lifecycle;
pub mod presence;
pub mod queue;
pub mod reconcile;
pub mod replicate;
pub mod server;
pub mod store;
#[cfg(test)]
pub mod testutil;
pub mod webhook;

use thiserror::Error;

/// Top-level error for bridge operations.
///
/// Individual modules carry their own error enums; this is the type queued
/// tasks and the sync paths converge on.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),
    #[error("helpdesk error: {0}")]
    Helpdesk(#[from] helpdesk::HelpdeskError),
    #[error("chat error: {0}")]
    Chat(#[from] chat::ChatError),
    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),
    #[error("config error: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}
