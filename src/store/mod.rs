//! Durable bridge state: ticket↔thread mapping, synced-article ledger,
//! webhook-delivery ledger, and actor mapping.
//!
//! The store is the only owner of persisted rows and the only state trusted
//! across a restart. Connections are opened per call with a busy timeout;
//! the design assumes exactly one live process instance.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
}

/// One thread per open ticket; closed variants are states, never removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketThread {
    pub ticket_id: u64,
    pub ticket_number: String,
    pub thread_id: u64,
    pub header_message_id: u64,
    pub channel_id: u64,
    pub title: String,
    /// Normalized (lower-cased) remote state name.
    pub state: String,
    /// Last thread name pushed to the platform; rename is a no-op while the
    /// rendered name matches.
    pub thread_name: String,
    /// Fingerprint of the last rendered status display; the header is only
    /// edited when it changes.
    pub header_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Direction of a replicated article.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    RemoteToLocal,
    LocalToRemote,
}

impl SyncDirection {
    fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::RemoteToLocal => "remote_to_local",
            SyncDirection::LocalToRemote => "local_to_remote",
        }
    }

    fn parse(raw: &str) -> SyncDirection {
        match raw {
            "local_to_remote" => SyncDirection::LocalToRemote,
            _ => SyncDirection::RemoteToLocal,
        }
    }
}

/// A row in the article dedup ledger.
#[derive(Debug, Clone)]
pub struct SyncedArticle {
    pub article_id: u64,
    pub ticket_id: u64,
    pub thread_id: u64,
    pub local_message_id: Option<u64>,
    pub direction: SyncDirection,
    pub synced_at: DateTime<Utc>,
}

/// Chat-side actor linked to a helpdesk-side actor for attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorLink {
    pub local_actor_id: u64,
    pub remote_email: String,
    pub remote_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BridgeStore {
    path: PathBuf,
}

impl BridgeStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ticket_threads (
                ticket_id INTEGER PRIMARY KEY,
                ticket_number TEXT NOT NULL,
                thread_id INTEGER NOT NULL UNIQUE,
                header_message_id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                state TEXT NOT NULL,
                thread_name TEXT NOT NULL DEFAULT '',
                header_fingerprint TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS synced_articles (
                article_id INTEGER PRIMARY KEY,
                ticket_id INTEGER NOT NULL,
                thread_id INTEGER NOT NULL,
                local_message_id INTEGER,
                direction TEXT NOT NULL,
                synced_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS synced_articles_ticket_idx
                ON synced_articles(ticket_id);
            CREATE TABLE IF NOT EXISTS webhook_deliveries (
                delivery_id TEXT PRIMARY KEY,
                received_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS actor_map (
                local_actor_id INTEGER PRIMARY KEY,
                remote_email TEXT NOT NULL,
                remote_id INTEGER
            );",
        )?;
        Ok(conn)
    }

    // --- ticket threads -----------------------------------------------------

    pub fn upsert_thread(&self, thread: &TicketThread) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO ticket_threads
                (ticket_id, ticket_number, thread_id, header_message_id, channel_id,
                 title, state, thread_name, header_fingerprint, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(ticket_id) DO UPDATE SET
                ticket_number = excluded.ticket_number,
                thread_id = excluded.thread_id,
                header_message_id = excluded.header_message_id,
                channel_id = excluded.channel_id,
                title = excluded.title,
                state = excluded.state,
                thread_name = excluded.thread_name,
                header_fingerprint = excluded.header_fingerprint,
                updated_at = excluded.updated_at",
            params![
                thread.ticket_id as i64,
                thread.ticket_number,
                thread.thread_id as i64,
                thread.header_message_id as i64,
                thread.channel_id as i64,
                thread.title,
                thread.state,
                thread.thread_name,
                thread.header_fingerprint,
                format_datetime(thread.created_at),
                format_datetime(thread.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn thread_by_ticket(&self, ticket_id: u64) -> Result<Option<TicketThread>, StoreError> {
        self.query_thread("ticket_id = ?1", ticket_id)
    }

    pub fn thread_by_thread_id(&self, thread_id: u64) -> Result<Option<TicketThread>, StoreError> {
        self.query_thread("thread_id = ?1", thread_id)
    }

    fn query_thread(&self, clause: &str, key: u64) -> Result<Option<TicketThread>, StoreError> {
        let conn = self.open()?;
        let sql = format!(
            "SELECT ticket_id, ticket_number, thread_id, header_message_id, channel_id,
                    title, state, thread_name, header_fingerprint, created_at, updated_at
             FROM ticket_threads WHERE {clause}"
        );
        let row = conn
            .query_row(&sql, params![key as i64], map_thread_row)
            .optional()?;
        row.map(finish_thread_row).transpose()
    }

    pub fn list_threads(&self) -> Result<Vec<TicketThread>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT ticket_id, ticket_number, thread_id, header_message_id, channel_id,
                    title, state, thread_name, header_fingerprint, created_at, updated_at
             FROM ticket_threads ORDER BY ticket_id",
        )?;
        let rows = stmt.query_map([], map_thread_row)?;
        let mut threads = Vec::new();
        for row in rows {
            threads.push(finish_thread_row(row?)?);
        }
        Ok(threads)
    }

    /// Update state and title in one write, bumping `updated_at`. The bump
    /// is what the reconcile grace windows key off.
    pub fn record_ticket_facts(
        &self,
        ticket_id: u64,
        state: &str,
        title: &str,
    ) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE ticket_threads
             SET state = ?2, title = ?3, updated_at = ?4
             WHERE ticket_id = ?1",
            params![
                ticket_id as i64,
                state,
                title,
                format_datetime(Utc::now())
            ],
        )?;
        Ok(())
    }

    /// Remember the last rendered thread name / header fingerprint so
    /// renames and header edits stay no-ops until something changes.
    /// Does not bump `updated_at`; renders are not state transitions.
    pub fn record_render_state(
        &self,
        ticket_id: u64,
        thread_name: &str,
        header_fingerprint: &str,
    ) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE ticket_threads
             SET thread_name = ?2, header_fingerprint = ?3
             WHERE ticket_id = ?1",
            params![ticket_id as i64, thread_name, header_fingerprint],
        )?;
        Ok(())
    }

    pub fn touch_thread(&self, ticket_id: u64) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE ticket_threads SET updated_at = ?2 WHERE ticket_id = ?1",
            params![ticket_id as i64, format_datetime(Utc::now())],
        )?;
        Ok(())
    }

    // --- synced-article ledger ----------------------------------------------

    /// Idempotent insert; returns false when the article was already ledgered.
    pub fn insert_synced_article(&self, article: &SyncedArticle) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let rows = conn.execute(
            "INSERT OR IGNORE INTO synced_articles
                (article_id, ticket_id, thread_id, local_message_id, direction, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                article.article_id as i64,
                article.ticket_id as i64,
                article.thread_id as i64,
                article.local_message_id.map(|id| id as i64),
                article.direction.as_str(),
                format_datetime(article.synced_at),
            ],
        )?;
        Ok(rows > 0)
    }

    pub fn article_synced(&self, article_id: u64) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM synced_articles WHERE article_id = ?1",
                params![article_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    pub fn synced_articles_for_ticket(
        &self,
        ticket_id: u64,
    ) -> Result<Vec<SyncedArticle>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT article_id, ticket_id, thread_id, local_message_id, direction, synced_at
             FROM synced_articles WHERE ticket_id = ?1 ORDER BY article_id",
        )?;
        let rows = stmt.query_map(params![ticket_id as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut articles = Vec::new();
        for row in rows {
            let (article_id, ticket_id, thread_id, local_message_id, direction, synced_at) = row?;
            articles.push(SyncedArticle {
                article_id: article_id as u64,
                ticket_id: ticket_id as u64,
                thread_id: thread_id as u64,
                local_message_id: local_message_id.map(|id| id as u64),
                direction: SyncDirection::parse(&direction),
                synced_at: parse_datetime(&synced_at)?,
            });
        }
        Ok(articles)
    }

    /// Drop ledger rows older than `retention` for tickets whose thread state
    /// is one of `closed_states`. Open tickets keep their full ledger.
    pub fn prune_synced_articles(
        &self,
        retention: ChronoDuration,
        closed_states: &[String],
    ) -> Result<usize, StoreError> {
        if closed_states.is_empty() {
            return Ok(0);
        }
        let conn = self.open()?;
        let cutoff = format_datetime(Utc::now() - retention);
        let placeholders = (0..closed_states.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "DELETE FROM synced_articles
             WHERE synced_at < ?1
               AND ticket_id IN (
                   SELECT ticket_id FROM ticket_threads WHERE state IN ({placeholders})
               )"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&cutoff];
        for state in closed_states {
            values.push(state);
        }
        let rows = stmt.execute(values.as_slice())?;
        Ok(rows)
    }

    // --- webhook-delivery ledger ----------------------------------------------

    /// Insert before processing; returns false when the delivery id is
    /// already present (duplicate resend, discard silently).
    pub fn insert_delivery(&self, delivery_id: &str) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let rows = conn.execute(
            "INSERT OR IGNORE INTO webhook_deliveries (delivery_id, received_at)
             VALUES (?1, ?2)",
            params![delivery_id, format_datetime(Utc::now())],
        )?;
        Ok(rows > 0)
    }

    /// Remove on processing failure so the sender's retry can succeed.
    pub fn remove_delivery(&self, delivery_id: &str) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "DELETE FROM webhook_deliveries WHERE delivery_id = ?1",
            params![delivery_id],
        )?;
        Ok(())
    }

    pub fn prune_deliveries(&self, retention: ChronoDuration) -> Result<usize, StoreError> {
        let conn = self.open()?;
        let cutoff = format_datetime(Utc::now() - retention);
        let rows = conn.execute(
            "DELETE FROM webhook_deliveries WHERE received_at < ?1",
            params![cutoff],
        )?;
        Ok(rows)
    }

    // --- actor map --------------------------------------------------------------

    pub fn upsert_actor(&self, link: &ActorLink) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO actor_map (local_actor_id, remote_email, remote_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(local_actor_id) DO UPDATE SET
                remote_email = excluded.remote_email,
                remote_id = excluded.remote_id",
            params![
                link.local_actor_id as i64,
                link.remote_email,
                link.remote_id.map(|id| id as i64),
            ],
        )?;
        Ok(())
    }

    pub fn actor_by_local(&self, local_actor_id: u64) -> Result<Option<ActorLink>, StoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT local_actor_id, remote_email, remote_id
                 FROM actor_map WHERE local_actor_id = ?1",
                params![local_actor_id as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(local_actor_id, remote_email, remote_id)| ActorLink {
            local_actor_id: local_actor_id as u64,
            remote_email,
            remote_id: remote_id.map(|id| id as u64),
        }))
    }
}

type ThreadRow = (
    i64,
    String,
    i64,
    i64,
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
);

fn map_thread_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn finish_thread_row(row: ThreadRow) -> Result<TicketThread, StoreError> {
    let (
        ticket_id,
        ticket_number,
        thread_id,
        header_message_id,
        channel_id,
        title,
        state,
        thread_name,
        header_fingerprint,
        created_at,
        updated_at,
    ) = row;
    Ok(TicketThread {
        ticket_id: ticket_id as u64,
        ticket_number,
        thread_id: thread_id as u64,
        header_message_id: header_message_id as u64,
        channel_id: channel_id as u64,
        title,
        state,
        thread_name,
        header_fingerprint,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}
