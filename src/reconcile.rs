//! Full-ticket sync orchestration and the periodic reconcile pass.
//!
//! [`SyncEngine::sync_ticket`] is the one entry point that brings a single
//! ticket's thread fully up to date; webhook dispatch and the reconciler both
//! funnel through it, always behind the ticket's queue. The reconciler is the
//! safety net for missed webhooks: it walks the remote listing on an
//! interval, repairs drift, and applies close/reopen only after the
//! corresponding grace window has elapsed and a fresh point read agrees.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::helpdesk::{HelpdeskApi, HelpdeskError};
use crate::lifecycle::LifecycleManager;
use crate::queue::TicketQueues;
use crate::replicate::Replicator;
use crate::store::BridgeStore;
use crate::BridgeError;

/// Ledger entries for tickets closed longer than this are pruned.
const LEDGER_RETENTION_DAYS: i64 = 30;
/// Webhook delivery ids are kept this long for dedup.
const DELIVERY_RETENTION_HOURS: i64 = 24;

/// Brings one ticket's thread up to date: mapping, state, name, status
/// display, then pending articles, in that order.
pub struct SyncEngine {
    store: BridgeStore,
    helpdesk: Arc<dyn HelpdeskApi>,
    lifecycle: LifecycleManager,
    replicator: Replicator,
}

impl SyncEngine {
    pub fn new(
        store: BridgeStore,
        helpdesk: Arc<dyn HelpdeskApi>,
        lifecycle: LifecycleManager,
        replicator: Replicator,
    ) -> Self {
        Self {
            store,
            helpdesk,
            lifecycle,
            replicator,
        }
    }

    /// Full sync of one ticket. Runs behind the ticket's queue.
    pub async fn sync_ticket(&self, ticket_id: u64) -> Result<(), BridgeError> {
        self.sync_ticket_inner(ticket_id, true).await
    }

    /// State/name/header only; article catch-up is skipped. Used by the
    /// reconciler between article catch-up windows.
    pub async fn sync_ticket_state(&self, ticket_id: u64) -> Result<(), BridgeError> {
        self.sync_ticket_inner(ticket_id, false).await
    }

    async fn sync_ticket_inner(&self, ticket_id: u64, with_articles: bool) -> Result<(), BridgeError> {
        let ticket = self.helpdesk.fetch_ticket(ticket_id).await?;

        let thread = self.lifecycle.ensure_thread(&ticket).await?;
        self.lifecycle.apply_state(&ticket, &thread).await?;
        self.lifecycle.rename_if_needed(&ticket, &thread).await?;

        // Re-read: the steps above may have advanced the stored render state.
        let Some(thread) = self.store.thread_by_ticket(ticket_id)? else {
            return Err(BridgeError::Other(format!(
                "thread mapping for ticket {ticket_id} vanished mid-sync"
            )));
        };
        self.lifecycle.refresh_header(&ticket, &thread).await?;

        if with_articles {
            self.replicator.sync_remote_articles(ticket_id, &thread).await?;
            self.lifecycle.enforce_membership(&thread).await;
        }
        Ok(())
    }

    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }
}

/// Outcome counters of one reconcile pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    pub synced: usize,
    pub closes_applied: usize,
    pub closes_deferred: usize,
    pub reopens_deferred: usize,
    pub errors: usize,
}

pub struct Reconciler {
    engine: Arc<SyncEngine>,
    store: BridgeStore,
    helpdesk: Arc<dyn HelpdeskApi>,
    queues: TicketQueues,
    close_grace: Duration,
    reopen_grace: Duration,
    article_catchup_interval: Duration,
    closed_states: Vec<String>,
    running: AtomicBool,
    last_catchup: tokio::sync::Mutex<HashMap<u64, Instant>>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<SyncEngine>,
        store: BridgeStore,
        helpdesk: Arc<dyn HelpdeskApi>,
        queues: TicketQueues,
        close_grace: Duration,
        reopen_grace: Duration,
        article_catchup_interval: Duration,
        closed_states: Vec<String>,
    ) -> Self {
        Self {
            engine,
            store,
            helpdesk,
            queues,
            close_grace,
            reopen_grace,
            article_catchup_interval,
            closed_states,
            running: AtomicBool::new(false),
            last_catchup: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Periodic loop. Pass failures are logged and the loop keeps going.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_pass().await {
                Ok(stats) => debug!(?stats, "reconcile pass complete"),
                Err(err) => error!("reconcile pass failed: {err}"),
            }
        }
    }

    /// One reconcile pass. Re-entrant calls are rejected: a slow pass must
    /// never overlap the next one.
    pub async fn run_pass(&self) -> Result<PassStats, BridgeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("reconcile pass still running, skipping this tick");
            return Ok(PassStats::default());
        }
        let result = self.pass_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn pass_inner(&self) -> Result<PassStats, BridgeError> {
        let mut stats = PassStats::default();
        let now = Utc::now();

        let listed = self.helpdesk.list_tickets(None).await?;
        let stored = self.store.list_threads()?;

        let mut listed_ids = std::collections::HashSet::new();
        for ticket in &listed {
            listed_ids.insert(ticket.id);

            // A recent local close outweighs possibly stale list data; the
            // next pass will see it again if the reopen is real.
            if let Some(thread) = stored.iter().find(|t| t.ticket_id == ticket.id) {
                let locally_closed = self.is_closed_name(&thread.state);
                let listed_open = !self.is_closed_name(&ticket.state);
                if locally_closed && listed_open {
                    let age = (now - thread.updated_at).to_std().unwrap_or_default();
                    if age < self.reopen_grace {
                        debug!(
                            ticket_id = ticket.id,
                            "reopen inside grace window, deferring"
                        );
                        stats.reopens_deferred += 1;
                        continue;
                    }
                }
            }

            let with_articles = self.catchup_due(ticket.id).await;
            let engine = self.engine.clone();
            let ticket_id = ticket.id;
            let outcome = self
                .queues
                .run(ticket_id, async move {
                    if with_articles {
                        engine.sync_ticket(ticket_id).await
                    } else {
                        engine.sync_ticket_state(ticket_id).await
                    }
                })
                .await;
            match outcome {
                Ok(()) => stats.synced += 1,
                Err(err) => {
                    error!(ticket_id, "reconcile sync failed: {err}");
                    stats.errors += 1;
                }
            }
        }

        // Threads whose ticket vanished from the listing: close candidates.
        for thread in &stored {
            if listed_ids.contains(&thread.ticket_id) || self.is_closed_name(&thread.state) {
                continue;
            }
            let age = (now - thread.updated_at).to_std().unwrap_or_default();
            if age < self.close_grace {
                debug!(
                    ticket_id = thread.ticket_id,
                    "list absence inside grace window, deferring close"
                );
                stats.closes_deferred += 1;
                continue;
            }
            // Grace elapsed; the point read is the authority.
            let engine = self.engine.clone();
            let ticket_id = thread.ticket_id;
            let outcome = self
                .queues
                .run(ticket_id, async move { engine.sync_ticket(ticket_id).await })
                .await;
            match outcome {
                Ok(()) => stats.closes_applied += 1,
                Err(BridgeError::Helpdesk(HelpdeskError::Api { status: 404, .. })) => {
                    warn!(ticket_id, "ticket gone from helpdesk, leaving thread as is");
                }
                Err(err) => {
                    error!(ticket_id, "close confirmation failed: {err}");
                    stats.errors += 1;
                }
            }
        }

        let pruned_deliveries = self
            .store
            .prune_deliveries(ChronoDuration::hours(DELIVERY_RETENTION_HOURS))?;
        let pruned_ledger = self.store.prune_synced_articles(
            ChronoDuration::days(LEDGER_RETENTION_DAYS),
            &self.closed_states,
        )?;
        if pruned_deliveries > 0 || pruned_ledger > 0 {
            info!(pruned_deliveries, pruned_ledger, "pruned bookkeeping rows");
        }

        Ok(stats)
    }

    fn is_closed_name(&self, state: &str) -> bool {
        let normalized = state.trim().to_lowercase();
        self.closed_states.iter().any(|s| *s == normalized)
    }

    /// Article catch-up runs on a coarser sub-interval than the state pass.
    async fn catchup_due(&self, ticket_id: u64) -> bool {
        let mut map = self.last_catchup.lock().await;
        let now = Instant::now();
        match map.get(&ticket_id) {
            Some(last) if now.duration_since(*last) < self.article_catchup_interval => false,
            _ => {
                map.insert(ticket_id, now);
                true
            }
        }
    }
}
