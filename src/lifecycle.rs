//! Thread lifecycle: creation, renaming, state transitions and the status
//! display at the head of each thread.
//!
//! Ticket states partition into three classes. OPEN threads are visible with
//! members present; HIDDEN threads have members removed (one sub-state also
//! archives, taking the thread out of member thread lists); CLOSED threads
//! are locked, archived and emptied. Transitions are an exhaustive table, so
//! an unhandled combination is a compile error, not a silent string
//! comparison falling through.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::cache::Cached;
use crate::chat::{ChatApi, Embed, EmbedField, MessagePayload, THREAD_NAME_MAX};
use crate::helpdesk::{HelpdeskApi, Ticket};
use crate::store::{BridgeStore, TicketThread};
use crate::BridgeError;

const ROLE_CACHE_TTL: Duration = Duration::from_secs(300);

const COLOR_OPEN: u32 = 0x2ECC71;
const COLOR_HIDDEN: u32 = 0xF1C40F;
const COLOR_CLOSED: u32 = 0x95A5A6;
const COLOR_OVERDUE: u32 = 0xE74C3C;

/// Visibility class of a normalized ticket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateClass {
    Open,
    Hidden { archive: bool },
    Closed,
}

impl StateClass {
    pub fn is_closed(&self) -> bool {
        matches!(self, StateClass::Closed)
    }
}

/// Maps normalized state names to classes. Built from configuration; state
/// names the map has never heard of classify as OPEN with a warning rather
/// than failing the pass.
#[derive(Debug, Clone)]
pub struct StateMap {
    hidden: Vec<String>,
    hidden_archive: Vec<String>,
    closed: Vec<String>,
}

impl StateMap {
    pub fn new(hidden: Vec<String>, hidden_archive: Vec<String>, closed: Vec<String>) -> Self {
        Self {
            hidden,
            hidden_archive,
            closed,
        }
    }

    pub fn classify(&self, state: &str) -> StateClass {
        let normalized = state.trim().to_lowercase();
        if self.closed.iter().any(|s| *s == normalized) {
            return StateClass::Closed;
        }
        if self.hidden_archive.iter().any(|s| *s == normalized) {
            return StateClass::Hidden { archive: true };
        }
        if self.hidden.iter().any(|s| *s == normalized) {
            return StateClass::Hidden { archive: false };
        }
        match normalized.as_str() {
            "new" | "open" => {}
            other => warn!(state = other, "unmapped ticket state, treating as open"),
        }
        StateClass::Open
    }

}

/// One platform-level effect of a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadAction {
    Lock,
    Unlock,
    Archive,
    Unarchive,
    AddMembers,
    RemoveMembers,
}

/// The transition table. Member changes come before lock/archive so they
/// land while the thread is still mutable.
pub fn transition(from: StateClass, to: StateClass) -> Vec<ThreadAction> {
    use StateClass::*;
    use ThreadAction::*;
    match (from, to) {
        (Open, Open) | (Closed, Closed) => Vec::new(),
        (Open, Hidden { archive }) => {
            if archive {
                vec![RemoveMembers, Archive]
            } else {
                vec![RemoveMembers]
            }
        }
        (Open, Closed) | (Hidden { .. }, Closed) => vec![RemoveMembers, Lock, Archive],
        (Hidden { archive }, Open) => {
            if archive {
                vec![Unarchive, AddMembers]
            } else {
                vec![AddMembers]
            }
        }
        (Hidden { archive: a }, Hidden { archive: b }) => match (a, b) {
            (true, false) => vec![Unarchive],
            (false, true) => vec![Archive],
            _ => Vec::new(),
        },
        (Closed, Open) => vec![Unlock, Unarchive, AddMembers],
        (Closed, Hidden { archive }) => {
            if archive {
                vec![Unlock, RemoveMembers]
            } else {
                vec![Unlock, Unarchive, RemoveMembers]
            }
        }
    }
}

/// Thread name template: ticket number, optional short assignee label, title.
pub fn thread_name(number: &str, assignee: Option<&str>, title: &str) -> String {
    let name = match assignee.and_then(short_assignee_label) {
        Some(label) => format!("#{number} ({label}) {title}"),
        None => format!("#{number} {title}"),
    };
    truncate_chars(&name, THREAD_NAME_MAX)
}

/// First name / login part of an assignee, for compact thread names.
fn short_assignee_label(raw: &str) -> Option<String> {
    let label = raw
        .split(['@', ' ', '.'])
        .next()
        .map(str::trim)
        .filter(|part| !part.is_empty())?;
    Some(label.to_string())
}

fn truncate_chars(raw: &str, max: usize) -> String {
    if raw.chars().count() <= max {
        return raw.to_string();
    }
    let mut out: String = raw.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Status-display color: pure function of state class, overridden by the
/// alert color once a deadline has passed.
pub fn header_color(class: StateClass, overdue: bool) -> u32 {
    if overdue {
        return COLOR_OVERDUE;
    }
    match class {
        StateClass::Open => COLOR_OPEN,
        StateClass::Hidden { .. } => COLOR_HIDDEN,
        StateClass::Closed => COLOR_CLOSED,
    }
}

fn is_overdue(ticket: &Ticket) -> bool {
    ticket
        .pending_time
        .is_some_and(|deadline| deadline < Utc::now())
}

/// Render the status display for a ticket.
pub fn render_header(ticket: &Ticket, class: StateClass) -> Embed {
    let mut fields = vec![EmbedField {
        name: "State".to_string(),
        value: ticket.state.clone(),
        inline: true,
    }];
    if let Some(priority) = &ticket.priority {
        fields.push(EmbedField {
            name: "Priority".to_string(),
            value: priority.clone(),
            inline: true,
        });
    }
    if let Some(owner) = &ticket.owner {
        fields.push(EmbedField {
            name: "Assignee".to_string(),
            value: owner.clone(),
            inline: true,
        });
    }
    if let Some(pending) = ticket.pending_time {
        fields.push(EmbedField {
            name: "Due".to_string(),
            value: pending.to_rfc3339(),
            inline: true,
        });
    }
    Embed {
        title: Some(format!("Ticket #{} — {}", ticket.number, ticket.title)),
        description: None,
        color: header_color(class, is_overdue(ticket)),
        fields,
    }
}

/// Change-detection fingerprint over everything the header renders.
pub fn header_fingerprint(ticket: &Ticket, class: StateClass) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}",
        ticket.state,
        ticket.priority.as_deref().unwrap_or(""),
        ticket.owner.as_deref().unwrap_or(""),
        ticket
            .pending_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
        ticket.title,
        header_color(class, is_overdue(ticket)),
    )
}

/// Creates, renames, hides and closes threads in response to ticket facts.
pub struct LifecycleManager {
    store: BridgeStore,
    chat: Arc<dyn ChatApi>,
    helpdesk: Arc<dyn HelpdeskApi>,
    states: StateMap,
    channel_id: u64,
    member_role_ids: Vec<u64>,
    role_cache: Mutex<Option<Cached<Vec<u64>>>>,
}

impl LifecycleManager {
    pub fn new(
        store: BridgeStore,
        chat: Arc<dyn ChatApi>,
        helpdesk: Arc<dyn HelpdeskApi>,
        states: StateMap,
        channel_id: u64,
        member_role_ids: Vec<u64>,
    ) -> Self {
        Self {
            store,
            chat,
            helpdesk,
            states,
            channel_id,
            member_role_ids,
            role_cache: Mutex::new(None),
        }
    }

    /// Create the thread for a ticket on first sight, or return the stored
    /// mapping. A ticket already closed or hidden at creation time gets that
    /// class's effects immediately instead of the default open behavior.
    pub async fn ensure_thread(&self, ticket: &Ticket) -> Result<TicketThread, BridgeError> {
        if let Some(existing) = self.store.thread_by_ticket(ticket.id)? {
            return Ok(existing);
        }

        let class = self.states.classify(&ticket.state);
        let header = render_header(ticket, class);
        let header_message_id = self
            .chat
            .post_message(self.channel_id, &MessagePayload::embed(header), &[])
            .await?;
        let name = thread_name(&ticket.number, ticket.owner.as_deref(), &ticket.title);
        let thread_id = self
            .chat
            .start_thread(self.channel_id, header_message_id, &name)
            .await?;

        let now = Utc::now();
        let thread = TicketThread {
            ticket_id: ticket.id,
            ticket_number: ticket.number.clone(),
            thread_id,
            header_message_id,
            channel_id: self.channel_id,
            title: ticket.title.clone(),
            state: ticket.state.to_lowercase(),
            thread_name: name,
            header_fingerprint: header_fingerprint(ticket, class),
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_thread(&thread)?;
        info!(
            ticket_id = ticket.id,
            thread_id, "created thread for ticket #{}", ticket.number
        );

        match class {
            StateClass::Open => self.spawn_member_update(thread_id, true).await,
            other => {
                // Apply the non-open class's effects directly; the stored
                // state is already the target, so drive the table explicitly.
                self.run_actions(&thread, &transition(StateClass::Open, other))
                    .await?;
            }
        }
        Ok(thread)
    }

    /// Apply a ticket's current state to its stored thread.
    ///
    /// CLOSED→non-CLOSED only proceeds once a fresh point read independently
    /// confirms the ticket is no longer closed; list data alone is never
    /// trusted for a reopen.
    pub async fn apply_state(
        &self,
        ticket: &Ticket,
        stored: &TicketThread,
    ) -> Result<(), BridgeError> {
        let from = self.states.classify(&stored.state);
        let to = self.states.classify(&ticket.state);

        if from == to {
            if !stored.state.eq_ignore_ascii_case(&ticket.state) {
                // Same class, different name (e.g. new -> open); record it.
                self.store
                    .record_ticket_facts(ticket.id, &ticket.state.to_lowercase(), &ticket.title)?;
            }
            return Ok(());
        }

        if from.is_closed() && !to.is_closed() {
            let fresh = self.helpdesk.fetch_ticket(ticket.id).await?;
            if self.states.classify(&fresh.state).is_closed() {
                info!(
                    ticket_id = ticket.id,
                    "reopen not confirmed by point read, keeping thread closed"
                );
                return Ok(());
            }
        }

        self.run_actions(stored, &transition(from, to)).await?;
        self.store
            .record_ticket_facts(ticket.id, &ticket.state.to_lowercase(), &ticket.title)?;
        info!(
            ticket_id = ticket.id,
            from = ?from,
            to = ?to,
            "thread state transition applied"
        );
        Ok(())
    }

    /// Rename the thread if the rendered name changed; otherwise skip the
    /// API call entirely.
    pub async fn rename_if_needed(
        &self,
        ticket: &Ticket,
        stored: &TicketThread,
    ) -> Result<(), BridgeError> {
        let name = thread_name(&ticket.number, ticket.owner.as_deref(), &ticket.title);
        if name == stored.thread_name {
            return Ok(());
        }
        self.chat.rename_thread(stored.thread_id, &name).await?;
        self.store
            .record_render_state(ticket.id, &name, &stored.header_fingerprint)?;
        Ok(())
    }

    /// Re-render and edit the status display when any rendered fact changed.
    pub async fn refresh_header(
        &self,
        ticket: &Ticket,
        stored: &TicketThread,
    ) -> Result<(), BridgeError> {
        let class = self.states.classify(&ticket.state);
        let fingerprint = header_fingerprint(ticket, class);
        if fingerprint == stored.header_fingerprint {
            return Ok(());
        }
        let header = render_header(ticket, class);
        self.chat
            .edit_message(
                stored.channel_id,
                stored.header_message_id,
                &MessagePayload::embed(header),
            )
            .await?;
        self.store
            .record_render_state(ticket.id, &stored.thread_name, &fingerprint)?;
        Ok(())
    }

    /// Re-assert membership for the thread's current class. Transitions keep
    /// membership right on their own; this repairs drift (role changes,
    /// manual joins/leaves) during reconcile.
    pub async fn enforce_membership(&self, stored: &TicketThread) {
        let add = matches!(self.states.classify(&stored.state), StateClass::Open);
        self.spawn_member_update(stored.thread_id, add).await;
    }

    async fn run_actions(
        &self,
        thread: &TicketThread,
        actions: &[ThreadAction],
    ) -> Result<(), BridgeError> {
        for action in actions {
            match action {
                ThreadAction::Lock => {
                    self.chat
                        .set_thread_flags(thread.thread_id, Some(true), None)
                        .await?
                }
                ThreadAction::Unlock => {
                    self.chat
                        .set_thread_flags(thread.thread_id, Some(false), Some(false))
                        .await?
                }
                ThreadAction::Archive => {
                    self.chat
                        .set_thread_flags(thread.thread_id, None, Some(true))
                        .await?
                }
                ThreadAction::Unarchive => {
                    self.chat
                        .set_thread_flags(thread.thread_id, None, Some(false))
                        .await?
                }
                ThreadAction::AddMembers => self.spawn_member_update(thread.thread_id, true).await,
                ThreadAction::RemoveMembers => {
                    self.spawn_member_update(thread.thread_id, false).await
                }
            }
        }
        Ok(())
    }

    /// Member churn runs as a spawned task so a slow membership fan-out never
    /// stalls the ticket's queue; failures are captured and logged.
    async fn spawn_member_update(&self, thread_id: u64, add: bool) {
        let members = match self.role_member_ids().await {
            Ok(members) => members,
            Err(err) => {
                error!(thread_id, "role membership lookup failed: {err}");
                return;
            }
        };
        let chat = self.chat.clone();
        tokio::spawn(async move {
            for user_id in members {
                let result = if add {
                    chat.add_thread_member(thread_id, user_id).await
                } else {
                    chat.remove_thread_member(thread_id, user_id).await
                };
                if let Err(err) = result {
                    warn!(
                        thread_id,
                        user_id,
                        add,
                        "thread member update failed: {err}"
                    );
                }
            }
        });
    }

    async fn role_member_ids(&self) -> Result<Vec<u64>, BridgeError> {
        let mut cache = self.role_cache.lock().await;
        if let Some(cell) = cache.as_ref() {
            if let Some(fresh) = cell.fresh() {
                return Ok(fresh.clone());
            }
        }
        let mut members = Vec::new();
        for role_id in &self.member_role_ids {
            members.extend(self.chat.role_members(*role_id).await?);
        }
        members.sort_unstable();
        members.dedup();
        *cache = Some(Cached::new(members.clone(), ROLE_CACHE_TTL));
        Ok(members)
    }
}
