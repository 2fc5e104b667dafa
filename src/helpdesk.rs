//! Remote helpdesk REST client.
//!
//! Speaks the helpdesk's token-authenticated JSON API (`/api/v1/...`).
//! Every request carries a bounded timeout so a hung remote never blocks a
//! queue indefinitely. The surface is a trait so the engine and tests can
//! swap in fakes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};

const PAGE_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum HelpdeskError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("helpdesk returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("attachment exceeds download safety cap ({limit} bytes)")]
    AttachmentTooLarge { limit: u64 },
    #[error("state not found: {0}")]
    UnknownState(String),
}

/// A ticket as returned with `expand=true` (relation names resolved).
#[derive(Debug, Clone, Deserialize)]
pub struct Ticket {
    pub id: u64,
    pub number: String,
    pub title: String,
    /// Resolved state name, e.g. "open", "closed", "pending reminder".
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub owner_id: Option<u64>,
    #[serde(default)]
    pub customer_id: Option<u64>,
    #[serde(default)]
    pub group_id: Option<u64>,
    #[serde(default)]
    pub pending_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub article_ids: Vec<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One message/note/event on a ticket.
#[derive(Debug, Clone, Deserialize)]
pub struct Article {
    pub id: u64,
    pub ticket_id: u64,
    /// "Agent", "Customer" or "System".
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub attachments: Vec<ArticleAttachment>,
    pub created_at: DateTime<Utc>,
}

impl Article {
    pub fn is_system(&self) -> bool {
        self.sender.eq_ignore_ascii_case("system")
    }

    pub fn sender_label(&self) -> &str {
        self.from
            .as_deref()
            .or(self.created_by.as_deref())
            .unwrap_or(&self.sender)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArticleAttachment {
    pub id: u64,
    pub filename: String,
    /// Declared size; the API reports this as a string, and it may be absent.
    #[serde(default, deserialize_with = "de_opt_size")]
    pub size: Option<u64>,
    #[serde(default)]
    pub preferences: serde_json::Value,
}

impl ArticleAttachment {
    pub fn content_type(&self) -> Option<&str> {
        self.preferences
            .get("Content-Type")
            .and_then(|value| value.as_str())
    }
}

fn de_opt_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
        Null,
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Some(n),
        Raw::Text(s) => s.trim().parse().ok(),
        Raw::Null => None,
    })
}

/// Field updates applied to a ticket; unset fields are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TicketUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_time: Option<DateTime<Utc>>,
}

/// Attachment payload for article creation (base64-encoded body).
#[derive(Debug, Clone, Serialize)]
pub struct NewAttachment {
    pub filename: String,
    pub data: String,
    #[serde(rename = "mime-type")]
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewArticle {
    pub ticket_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    pub content_type: String,
    /// Channel-typed routing: "note", "web", "email".
    #[serde(rename = "type")]
    pub article_type: String,
    pub internal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Helpdesk user the article is authored on behalf of.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_by_id: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<NewAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketState {
    pub id: u64,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelpdeskUser {
    pub id: u64,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub value_from: Option<String>,
    #[serde(default)]
    pub value_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Consumed surface of the remote helpdesk.
#[async_trait]
pub trait HelpdeskApi: Send + Sync {
    /// Point read with relations expanded. This is the authoritative read
    /// the close/reopen guards depend on.
    async fn fetch_ticket(&self, ticket_id: u64) -> Result<Ticket, HelpdeskError>;
    /// Full listing for a state filter, paginated internally.
    async fn list_tickets(&self, state_filter: Option<&str>) -> Result<Vec<Ticket>, HelpdeskError>;
    async fn update_ticket(
        &self,
        ticket_id: u64,
        update: &TicketUpdate,
    ) -> Result<Ticket, HelpdeskError>;
    async fn list_articles(&self, ticket_id: u64) -> Result<Vec<Article>, HelpdeskError>;
    async fn create_article(&self, article: &NewArticle) -> Result<Article, HelpdeskError>;
    /// Download one attachment, hard-capped at `safety_cap` bytes regardless
    /// of the declared size.
    async fn download_attachment(
        &self,
        ticket_id: u64,
        article_id: u64,
        attachment_id: u64,
        safety_cap: u64,
    ) -> Result<Vec<u8>, HelpdeskError>;
    async fn list_tags(&self, ticket_id: u64) -> Result<Vec<String>, HelpdeskError>;
    async fn add_tag(&self, ticket_id: u64, tag: &str) -> Result<(), HelpdeskError>;
    async fn remove_tag(&self, ticket_id: u64, tag: &str) -> Result<(), HelpdeskError>;
    /// Merge `source_ticket_id` into the ticket with `target_number`.
    async fn merge_tickets(
        &self,
        source_ticket_id: u64,
        target_number: &str,
    ) -> Result<(), HelpdeskError>;
    async fn ticket_history(&self, ticket_id: u64) -> Result<Vec<HistoryEvent>, HelpdeskError>;
    async fn list_states(&self) -> Result<Vec<TicketState>, HelpdeskError>;
    async fn lookup_state(&self, name: &str) -> Result<TicketState, HelpdeskError>;
    async fn search_tickets(&self, query: &str) -> Result<Vec<Ticket>, HelpdeskError>;
    async fn search_users(&self, query: &str) -> Result<Vec<HelpdeskUser>, HelpdeskError>;
    async fn add_time_entry(
        &self,
        ticket_id: u64,
        time_unit: f64,
        comment: Option<&str>,
    ) -> Result<(), HelpdeskError>;
    /// Cheap bounded-timeout round trip for the readiness probe.
    async fn probe(&self) -> Result<(), HelpdeskError>;
    /// Browser-facing URL for an attachment, used when the bytes themselves
    /// cannot be transferred inline.
    fn attachment_link(&self, ticket_id: u64, article_id: u64, attachment_id: u64) -> String;
}

/// reqwest-backed implementation.
#[derive(Debug, Clone)]
pub struct HttpHelpdesk {
    base_url: String,
    token: String,
    client: Client,
}

impl HttpHelpdesk {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, HelpdeskError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("Authorization", format!("Token token={}", self.token))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, HelpdeskError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(HelpdeskError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, HelpdeskError> {
        let response = self.authorized(self.client.get(self.url(path))).send().await?;
        Ok(Self::check(response).await?.json::<T>().await?)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        body: &impl Serialize,
    ) -> Result<T, HelpdeskError> {
        let response = self.authorized(builder).json(body).send().await?;
        Ok(Self::check(response).await?.json::<T>().await?)
    }
}

#[async_trait]
impl HelpdeskApi for HttpHelpdesk {
    async fn fetch_ticket(&self, ticket_id: u64) -> Result<Ticket, HelpdeskError> {
        self.get_json(&format!("/api/v1/tickets/{ticket_id}?expand=true"))
            .await
    }

    async fn list_tickets(&self, state_filter: Option<&str>) -> Result<Vec<Ticket>, HelpdeskError> {
        let mut tickets = Vec::new();
        let mut page = 1usize;
        loop {
            let path = format!(
                "/api/v1/tickets?expand=true&per_page={PAGE_SIZE}&page={page}"
            );
            let batch: Vec<Ticket> = self.get_json(&path).await?;
            let batch_len = batch.len();
            match state_filter {
                Some(filter) => tickets.extend(
                    batch
                        .into_iter()
                        .filter(|t| t.state.eq_ignore_ascii_case(filter)),
                ),
                None => tickets.extend(batch),
            }
            if batch_len < PAGE_SIZE {
                return Ok(tickets);
            }
            page += 1;
        }
    }

    async fn update_ticket(
        &self,
        ticket_id: u64,
        update: &TicketUpdate,
    ) -> Result<Ticket, HelpdeskError> {
        self.send_json(
            self.client
                .put(self.url(&format!("/api/v1/tickets/{ticket_id}?expand=true"))),
            update,
        )
        .await
    }

    async fn list_articles(&self, ticket_id: u64) -> Result<Vec<Article>, HelpdeskError> {
        self.get_json(&format!("/api/v1/ticket_articles/by_ticket/{ticket_id}"))
            .await
    }

    async fn create_article(&self, article: &NewArticle) -> Result<Article, HelpdeskError> {
        self.send_json(self.client.post(self.url("/api/v1/ticket_articles")), article)
            .await
    }

    async fn download_attachment(
        &self,
        ticket_id: u64,
        article_id: u64,
        attachment_id: u64,
        safety_cap: u64,
    ) -> Result<Vec<u8>, HelpdeskError> {
        let path = format!(
            "/api/v1/ticket_attachment/{ticket_id}/{article_id}/{attachment_id}"
        );
        let response = self.authorized(self.client.get(self.url(&path))).send().await?;
        let response = Self::check(response).await?;

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() as u64 + chunk.len() as u64 > safety_cap {
                return Err(HelpdeskError::AttachmentTooLarge { limit: safety_cap });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    async fn list_tags(&self, ticket_id: u64) -> Result<Vec<String>, HelpdeskError> {
        #[derive(Deserialize)]
        struct Tags {
            tags: Vec<String>,
        }
        let tags: Tags = self
            .get_json(&format!("/api/v1/tags?object=Ticket&o_id={ticket_id}"))
            .await?;
        Ok(tags.tags)
    }

    async fn add_tag(&self, ticket_id: u64, tag: &str) -> Result<(), HelpdeskError> {
        let body = serde_json::json!({"object": "Ticket", "o_id": ticket_id, "item": tag});
        let response = self
            .authorized(self.client.post(self.url("/api/v1/tags/add")))
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn remove_tag(&self, ticket_id: u64, tag: &str) -> Result<(), HelpdeskError> {
        let body = serde_json::json!({"object": "Ticket", "o_id": ticket_id, "item": tag});
        let response = self
            .authorized(self.client.delete(self.url("/api/v1/tags/remove")))
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn merge_tickets(
        &self,
        source_ticket_id: u64,
        target_number: &str,
    ) -> Result<(), HelpdeskError> {
        let path = format!("/api/v1/ticket_merge/{source_ticket_id}/{target_number}");
        let response = self.authorized(self.client.put(self.url(&path))).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn ticket_history(&self, ticket_id: u64) -> Result<Vec<HistoryEvent>, HelpdeskError> {
        #[derive(Deserialize)]
        struct History {
            #[serde(default)]
            history: Vec<HistoryEvent>,
        }
        let history: History = self
            .get_json(&format!("/api/v1/ticket_history/{ticket_id}"))
            .await?;
        Ok(history.history)
    }

    async fn list_states(&self) -> Result<Vec<TicketState>, HelpdeskError> {
        self.get_json("/api/v1/ticket_states").await
    }

    async fn lookup_state(&self, name: &str) -> Result<TicketState, HelpdeskError> {
        let states = self.list_states().await?;
        states
            .into_iter()
            .find(|state| state.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| HelpdeskError::UnknownState(name.to_string()))
    }

    async fn search_tickets(&self, query: &str) -> Result<Vec<Ticket>, HelpdeskError> {
        let encoded = urlencoding::encode(query);
        self.get_json(&format!(
            "/api/v1/tickets/search?expand=true&query={encoded}&per_page={PAGE_SIZE}"
        ))
        .await
    }

    async fn search_users(&self, query: &str) -> Result<Vec<HelpdeskUser>, HelpdeskError> {
        let encoded = urlencoding::encode(query);
        self.get_json(&format!(
            "/api/v1/users/search?query={encoded}&per_page={PAGE_SIZE}"
        ))
        .await
    }

    async fn add_time_entry(
        &self,
        ticket_id: u64,
        time_unit: f64,
        comment: Option<&str>,
    ) -> Result<(), HelpdeskError> {
        let body = serde_json::json!({
            "ticket_id": ticket_id,
            "time_unit": format!("{time_unit}"),
            "comment": comment,
        });
        let response = self
            .authorized(self.client.post(self.url("/api/v1/time_accountings")))
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn probe(&self) -> Result<(), HelpdeskError> {
        let response = self
            .authorized(
                self.client
                    .get(self.url("/api/v1/ticket_states?per_page=1")),
            )
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    fn attachment_link(&self, ticket_id: u64, article_id: u64, attachment_id: u64) -> String {
        self.url(&format!(
            "/api/v1/ticket_attachment/{ticket_id}/{article_id}/{attachment_id}"
        ))
    }
}
