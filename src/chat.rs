//! Chat platform client (Discord REST).
//!
//! Every mutating call passes through the global egress limiter before it
//! reaches the wire, so aggregate outbound rate stays bounded no matter how
//! many per-ticket queues are active. The surface is a trait so the engine
//! and tests can swap in fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::queue::EgressLimiter;

const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
/// Platform limit on thread names.
pub const THREAD_NAME_MAX: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat platform returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("egress queue unavailable")]
    Throttle,
    #[error("attachment exceeds download safety cap ({limit} bytes)")]
    AttachmentTooLarge { limit: u64 },
    #[error("malformed snowflake id {0:?}")]
    BadSnowflake(String),
}

fn parse_snowflake(raw: &str) -> Result<u64, ChatError> {
    raw.parse()
        .map_err(|_| ChatError::BadSnowflake(raw.to_string()))
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Status-display embed; color is decided by the lifecycle layer.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct MessagePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

impl MessagePayload {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            embeds: Vec::new(),
        }
    }

    pub fn embed(embed: Embed) -> Self {
        Self {
            content: None,
            embeds: vec![embed],
        }
    }
}

/// A file transferred inline with a message.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Consumed surface of the chat platform.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Post a message, optionally with inline files; returns the message id.
    async fn post_message(
        &self,
        channel_id: u64,
        payload: &MessagePayload,
        files: &[OutgoingFile],
    ) -> Result<u64, ChatError>;
    async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        payload: &MessagePayload,
    ) -> Result<(), ChatError>;
    /// Derive a thread from an already-posted message.
    async fn start_thread(
        &self,
        channel_id: u64,
        message_id: u64,
        name: &str,
    ) -> Result<u64, ChatError>;
    async fn rename_thread(&self, thread_id: u64, name: &str) -> Result<(), ChatError>;
    /// Lock/unlock and archive/unarchive in one call; `None` leaves a flag as is.
    async fn set_thread_flags(
        &self,
        thread_id: u64,
        locked: Option<bool>,
        archived: Option<bool>,
    ) -> Result<(), ChatError>;
    async fn add_thread_member(&self, thread_id: u64, user_id: u64) -> Result<(), ChatError>;
    async fn remove_thread_member(&self, thread_id: u64, user_id: u64) -> Result<(), ChatError>;
    /// Current member ids of a guild role.
    async fn role_members(&self, role_id: u64) -> Result<Vec<u64>, ChatError>;
    /// Download a platform-hosted attachment, hard-capped at `safety_cap`.
    async fn download_attachment(&self, url: &str, safety_cap: u64)
        -> Result<Vec<u8>, ChatError>;
}

#[derive(Debug, Clone, Deserialize)]
struct MessageResponse {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChannelResponse {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GuildMember {
    user: MemberUser,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MemberUser {
    id: String,
}

/// Discord REST implementation.
pub struct DiscordRest {
    api_base: String,
    bot_token: String,
    guild_id: u64,
    client: Client,
    egress: Arc<EgressLimiter>,
}

impl DiscordRest {
    pub fn new(
        bot_token: &str,
        guild_id: u64,
        timeout: Duration,
        egress: Arc<EgressLimiter>,
    ) -> Result<Self, ChatError> {
        Self::with_api_base(DEFAULT_API_BASE, bot_token, guild_id, timeout, egress)
    }

    pub fn with_api_base(
        api_base: &str,
        bot_token: &str,
        guild_id: u64,
        timeout: Duration,
        egress: Arc<EgressLimiter>,
    ) -> Result<Self, ChatError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            guild_id,
            client,
            egress,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ChatError> {
        let _permit = self
            .egress
            .acquire()
            .await
            .map_err(|_| ChatError::Throttle)?;
        let response = builder
            .header("Authorization", format!("Bot {}", self.bot_token))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ChatError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ChatApi for DiscordRest {
    async fn post_message(
        &self,
        channel_id: u64,
        payload: &MessagePayload,
        files: &[OutgoingFile],
    ) -> Result<u64, ChatError> {
        let url = self.url(&format!("/channels/{channel_id}/messages"));
        let builder = if files.is_empty() {
            self.client.post(url).json(payload)
        } else {
            let mut form = multipart::Form::new().text(
                "payload_json",
                serde_json::to_string(payload).unwrap_or_default(),
            );
            for (index, file) in files.iter().enumerate() {
                let part = multipart::Part::bytes(file.bytes.clone())
                    .file_name(file.filename.clone());
                form = form.part(format!("files[{index}]"), part);
            }
            self.client.post(url).multipart(form)
        };
        let message: MessageResponse = self.send(builder).await?.json().await?;
        parse_snowflake(&message.id)
    }

    async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        payload: &MessagePayload,
    ) -> Result<(), ChatError> {
        let url = self.url(&format!("/channels/{channel_id}/messages/{message_id}"));
        self.send(self.client.patch(url).json(payload)).await?;
        Ok(())
    }

    async fn start_thread(
        &self,
        channel_id: u64,
        message_id: u64,
        name: &str,
    ) -> Result<u64, ChatError> {
        let url = self.url(&format!(
            "/channels/{channel_id}/messages/{message_id}/threads"
        ));
        let body = serde_json::json!({ "name": name });
        let channel: ChannelResponse = self
            .send(self.client.post(url).json(&body))
            .await?
            .json()
            .await?;
        parse_snowflake(&channel.id)
    }

    async fn rename_thread(&self, thread_id: u64, name: &str) -> Result<(), ChatError> {
        let url = self.url(&format!("/channels/{thread_id}"));
        let body = serde_json::json!({ "name": name });
        self.send(self.client.patch(url).json(&body)).await?;
        Ok(())
    }

    async fn set_thread_flags(
        &self,
        thread_id: u64,
        locked: Option<bool>,
        archived: Option<bool>,
    ) -> Result<(), ChatError> {
        if locked.is_none() && archived.is_none() {
            return Ok(());
        }
        let url = self.url(&format!("/channels/{thread_id}"));
        let mut body = serde_json::Map::new();
        if let Some(locked) = locked {
            body.insert("locked".to_string(), serde_json::Value::Bool(locked));
        }
        if let Some(archived) = archived {
            body.insert("archived".to_string(), serde_json::Value::Bool(archived));
        }
        self.send(self.client.patch(url).json(&body)).await?;
        Ok(())
    }

    async fn add_thread_member(&self, thread_id: u64, user_id: u64) -> Result<(), ChatError> {
        let url = self.url(&format!("/channels/{thread_id}/thread-members/{user_id}"));
        self.send(self.client.put(url)).await?;
        Ok(())
    }

    async fn remove_thread_member(&self, thread_id: u64, user_id: u64) -> Result<(), ChatError> {
        let url = self.url(&format!("/channels/{thread_id}/thread-members/{user_id}"));
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn role_members(&self, role_id: u64) -> Result<Vec<u64>, ChatError> {
        let role_id = role_id.to_string();
        let mut members = Vec::new();
        let mut after = 0u64;
        loop {
            let url = self.url(&format!(
                "/guilds/{}/members?limit=1000&after={after}",
                self.guild_id
            ));
            let batch: Vec<GuildMember> = self.send(self.client.get(url)).await?.json().await?;
            let batch_len = batch.len();
            for member in batch {
                let id = parse_snowflake(&member.user.id)?;
                after = after.max(id);
                if member.roles.iter().any(|r| *r == role_id) {
                    members.push(id);
                }
            }
            if batch_len < 1000 {
                return Ok(members);
            }
        }
    }

    async fn download_attachment(
        &self,
        url: &str,
        safety_cap: u64,
    ) -> Result<Vec<u8>, ChatError> {
        // CDN URLs are pre-authorized; no bot token, but still throttled.
        let _permit = self
            .egress
            .acquire()
            .await
            .map_err(|_| ChatError::Throttle)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() as u64 + chunk.len() as u64 > safety_cap {
                return Err(ChatError::AttachmentTooLarge { limit: safety_cap });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}
