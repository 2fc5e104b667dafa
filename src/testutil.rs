//! In-memory fakes for the collaborator traits, shared by the unit tests of
//! the lifecycle, replication and reconcile layers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::chat::{ChatApi, ChatError, MessagePayload, OutgoingFile};
use crate::helpdesk::{
    Article, HelpdeskApi, HelpdeskError, HelpdeskUser, HistoryEvent, NewArticle, Ticket,
    TicketState, TicketUpdate,
};

pub fn ticket(id: u64, state: &str, title: &str) -> Ticket {
    Ticket {
        id,
        number: format!("{}", 70000 + id),
        title: title.to_string(),
        state: state.to_string(),
        priority: Some("2 normal".to_string()),
        owner: None,
        owner_id: None,
        customer_id: None,
        group_id: None,
        pending_time: None,
        article_ids: Vec::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn article(id: u64, ticket_id: u64, sender: &str, body: &str) -> Article {
    Article {
        id,
        ticket_id,
        sender: sender.to_string(),
        subject: None,
        body: body.to_string(),
        content_type: "text/plain".to_string(),
        internal: false,
        from: Some(format!("{sender} <{}@example.com>", sender.to_lowercase())),
        created_by: None,
        attachments: Vec::new(),
        created_at: Utc::now(),
    }
}

/// Scripted helpdesk. Tickets and articles are seeded by the test; article
/// creation is recorded for assertions.
#[derive(Default)]
pub struct FakeHelpdesk {
    pub tickets: Mutex<HashMap<u64, Ticket>>,
    pub articles: Mutex<HashMap<u64, Vec<Article>>>,
    pub created: Mutex<Vec<NewArticle>>,
    pub attachment_bytes: Mutex<HashMap<u64, Vec<u8>>>,
    pub fetch_calls: AtomicU64,
    pub probe_ok: Mutex<bool>,
    next_article_id: AtomicU64,
}

impl FakeHelpdesk {
    pub fn new() -> Self {
        Self {
            probe_ok: Mutex::new(true),
            next_article_id: AtomicU64::new(9000),
            ..Self::default()
        }
    }

    pub fn seed_ticket(&self, ticket: Ticket) {
        self.tickets.lock().unwrap().insert(ticket.id, ticket);
    }

    pub fn seed_articles(&self, ticket_id: u64, articles: Vec<Article>) {
        self.articles.lock().unwrap().insert(ticket_id, articles);
    }

    pub fn seed_attachment(&self, attachment_id: u64, bytes: Vec<u8>) {
        self.attachment_bytes
            .lock()
            .unwrap()
            .insert(attachment_id, bytes);
    }
}

#[async_trait]
impl HelpdeskApi for FakeHelpdesk {
    async fn fetch_ticket(&self, ticket_id: u64) -> Result<Ticket, HelpdeskError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.tickets
            .lock()
            .unwrap()
            .get(&ticket_id)
            .cloned()
            .ok_or(HelpdeskError::Api {
                status: 404,
                body: "not found".to_string(),
            })
    }

    async fn list_tickets(&self, state_filter: Option<&str>) -> Result<Vec<Ticket>, HelpdeskError> {
        let mut tickets: Vec<Ticket> = self.tickets.lock().unwrap().values().cloned().collect();
        if let Some(filter) = state_filter {
            tickets.retain(|t| t.state.eq_ignore_ascii_case(filter));
        }
        tickets.sort_by_key(|t| t.id);
        Ok(tickets)
    }

    async fn update_ticket(
        &self,
        ticket_id: u64,
        update: &TicketUpdate,
    ) -> Result<Ticket, HelpdeskError> {
        let mut tickets = self.tickets.lock().unwrap();
        let ticket = tickets.get_mut(&ticket_id).ok_or(HelpdeskError::Api {
            status: 404,
            body: "not found".to_string(),
        })?;
        if let Some(state) = &update.state {
            ticket.state = state.clone();
        }
        if let Some(title) = &update.title {
            ticket.title = title.clone();
        }
        Ok(ticket.clone())
    }

    async fn list_articles(&self, ticket_id: u64) -> Result<Vec<Article>, HelpdeskError> {
        Ok(self
            .articles
            .lock()
            .unwrap()
            .get(&ticket_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_article(&self, article: &NewArticle) -> Result<Article, HelpdeskError> {
        self.created.lock().unwrap().push(article.clone());
        let id = self.next_article_id.fetch_add(1, Ordering::SeqCst);
        Ok(Article {
            id,
            ticket_id: article.ticket_id,
            sender: article.sender.clone().unwrap_or_default(),
            subject: article.subject.clone(),
            body: article.body.clone(),
            content_type: article.content_type.clone(),
            internal: article.internal,
            from: None,
            created_by: None,
            attachments: Vec::new(),
            created_at: Utc::now(),
        })
    }

    async fn download_attachment(
        &self,
        _ticket_id: u64,
        _article_id: u64,
        attachment_id: u64,
        safety_cap: u64,
    ) -> Result<Vec<u8>, HelpdeskError> {
        let bytes = self
            .attachment_bytes
            .lock()
            .unwrap()
            .get(&attachment_id)
            .cloned()
            .ok_or(HelpdeskError::Api {
                status: 404,
                body: "no such attachment".to_string(),
            })?;
        if bytes.len() as u64 > safety_cap {
            return Err(HelpdeskError::AttachmentTooLarge { limit: safety_cap });
        }
        Ok(bytes)
    }

    async fn list_tags(&self, _ticket_id: u64) -> Result<Vec<String>, HelpdeskError> {
        Ok(Vec::new())
    }

    async fn add_tag(&self, _ticket_id: u64, _tag: &str) -> Result<(), HelpdeskError> {
        Ok(())
    }

    async fn remove_tag(&self, _ticket_id: u64, _tag: &str) -> Result<(), HelpdeskError> {
        Ok(())
    }

    async fn merge_tickets(
        &self,
        _source_ticket_id: u64,
        _target_number: &str,
    ) -> Result<(), HelpdeskError> {
        Ok(())
    }

    async fn ticket_history(&self, _ticket_id: u64) -> Result<Vec<HistoryEvent>, HelpdeskError> {
        Ok(Vec::new())
    }

    async fn list_states(&self) -> Result<Vec<TicketState>, HelpdeskError> {
        Ok(vec![
            TicketState {
                id: 1,
                name: "new".to_string(),
                active: true,
            },
            TicketState {
                id: 2,
                name: "open".to_string(),
                active: true,
            },
            TicketState {
                id: 4,
                name: "closed".to_string(),
                active: true,
            },
        ])
    }

    async fn lookup_state(&self, name: &str) -> Result<TicketState, HelpdeskError> {
        self.list_states()
            .await?
            .into_iter()
            .find(|state| state.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| HelpdeskError::UnknownState(name.to_string()))
    }

    async fn search_tickets(&self, _query: &str) -> Result<Vec<Ticket>, HelpdeskError> {
        Ok(Vec::new())
    }

    async fn search_users(&self, query: &str) -> Result<Vec<HelpdeskUser>, HelpdeskError> {
        if query.contains("alice") {
            return Ok(vec![HelpdeskUser {
                id: 77,
                login: "alice".to_string(),
                email: "alice@example.com".to_string(),
                firstname: "Alice".to_string(),
                lastname: "Agent".to_string(),
            }]);
        }
        Ok(Vec::new())
    }

    async fn add_time_entry(
        &self,
        _ticket_id: u64,
        _time_unit: f64,
        _comment: Option<&str>,
    ) -> Result<(), HelpdeskError> {
        Ok(())
    }

    async fn probe(&self) -> Result<(), HelpdeskError> {
        if *self.probe_ok.lock().unwrap() {
            Ok(())
        } else {
            Err(HelpdeskError::Api {
                status: 503,
                body: "down".to_string(),
            })
        }
    }

    fn attachment_link(&self, ticket_id: u64, article_id: u64, attachment_id: u64) -> String {
        format!("https://helpdesk.test/api/v1/ticket_attachment/{ticket_id}/{article_id}/{attachment_id}")
    }
}

/// One recorded chat call, in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCall {
    Post {
        channel_id: u64,
        content: Option<String>,
        file_names: Vec<String>,
    },
    Edit {
        channel_id: u64,
        message_id: u64,
    },
    StartThread {
        channel_id: u64,
        message_id: u64,
        name: String,
    },
    Rename {
        thread_id: u64,
        name: String,
    },
    Flags {
        thread_id: u64,
        locked: Option<bool>,
        archived: Option<bool>,
    },
    AddMember {
        thread_id: u64,
        user_id: u64,
    },
    RemoveMember {
        thread_id: u64,
        user_id: u64,
    },
}

#[derive(Default)]
pub struct FakeChat {
    pub calls: Mutex<Vec<ChatCall>>,
    pub role_map: Mutex<HashMap<u64, Vec<u64>>>,
    pub attachment_bytes: Mutex<HashMap<String, Vec<u8>>>,
    /// Post calls fail while nonzero, decrementing per attempt.
    pub post_failures: AtomicU64,
    next_id: AtomicU64,
}

impl FakeChat {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(5000),
            ..Self::default()
        }
    }

    pub fn seed_role(&self, role_id: u64, members: Vec<u64>) {
        self.role_map.lock().unwrap().insert(role_id, members);
    }

    pub fn seed_attachment(&self, url: &str, bytes: Vec<u8>) {
        self.attachment_bytes
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes);
    }

    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn posted_contents(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChatCall::Post { content, .. } => content,
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChatApi for FakeChat {
    async fn post_message(
        &self,
        channel_id: u64,
        payload: &MessagePayload,
        files: &[OutgoingFile],
    ) -> Result<u64, ChatError> {
        if self.post_failures.load(Ordering::SeqCst) > 0 {
            self.post_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ChatError::Api {
                status: 500,
                body: "scripted failure".to_string(),
            });
        }
        self.calls.lock().unwrap().push(ChatCall::Post {
            channel_id,
            content: payload.content.clone(),
            file_names: files.iter().map(|f| f.filename.clone()).collect(),
        });
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        _payload: &MessagePayload,
    ) -> Result<(), ChatError> {
        self.calls.lock().unwrap().push(ChatCall::Edit {
            channel_id,
            message_id,
        });
        Ok(())
    }

    async fn start_thread(
        &self,
        channel_id: u64,
        message_id: u64,
        name: &str,
    ) -> Result<u64, ChatError> {
        self.calls.lock().unwrap().push(ChatCall::StartThread {
            channel_id,
            message_id,
            name: name.to_string(),
        });
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn rename_thread(&self, thread_id: u64, name: &str) -> Result<(), ChatError> {
        self.calls.lock().unwrap().push(ChatCall::Rename {
            thread_id,
            name: name.to_string(),
        });
        Ok(())
    }

    async fn set_thread_flags(
        &self,
        thread_id: u64,
        locked: Option<bool>,
        archived: Option<bool>,
    ) -> Result<(), ChatError> {
        self.calls.lock().unwrap().push(ChatCall::Flags {
            thread_id,
            locked,
            archived,
        });
        Ok(())
    }

    async fn add_thread_member(&self, thread_id: u64, user_id: u64) -> Result<(), ChatError> {
        self.calls
            .lock()
            .unwrap()
            .push(ChatCall::AddMember { thread_id, user_id });
        Ok(())
    }

    async fn remove_thread_member(&self, thread_id: u64, user_id: u64) -> Result<(), ChatError> {
        self.calls
            .lock()
            .unwrap()
            .push(ChatCall::RemoveMember { thread_id, user_id });
        Ok(())
    }

    async fn role_members(&self, role_id: u64) -> Result<Vec<u64>, ChatError> {
        Ok(self
            .role_map
            .lock()
            .unwrap()
            .get(&role_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn download_attachment(
        &self,
        url: &str,
        safety_cap: u64,
    ) -> Result<Vec<u8>, ChatError> {
        let bytes = self
            .attachment_bytes
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(ChatError::Api {
                status: 404,
                body: "no such file".to_string(),
            })?;
        if bytes.len() as u64 > safety_cap {
            return Err(ChatError::AttachmentTooLarge { limit: safety_cap });
        }
        Ok(bytes)
    }
}
