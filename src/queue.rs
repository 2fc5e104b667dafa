//! Task serialization: per-ticket FIFO queues and the global egress limiter.
//!
//! All work touching one ticket funnels through that ticket's queue, so two
//! logically concurrent handlers can never interleave mutations on the same
//! thread. Different tickets proceed fully in parallel. Every call to the
//! chat platform additionally passes the egress limiter, which caps both
//! in-flight concurrency and aggregate ops per second.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Semaphore};
use tokio::time::Instant;
use tracing::error;

use crate::BridgeError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
    #[error("queued task panicked")]
    TaskPanicked,
}

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type QueueMap = Arc<Mutex<HashMap<u64, UnboundedSender<Job>>>>;

/// Per-ticket FIFO queues, concurrency 1 per ticket.
///
/// Queues are created lazily on first use and discarded once drained. A task
/// that fails logs with its ticket id and returns the error to its caller; it
/// never stops the worker from running subsequent tasks.
#[derive(Clone, Default)]
pub struct TicketQueues {
    inner: QueueMap,
}

impl TicketQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` serialized behind all earlier work for `ticket_id`.
    pub async fn run<T, F>(&self, ticket_id: u64, task: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, BridgeError>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<Result<T, BridgeError>>();
        let job: Job = Box::pin(async move {
            let outcome = std::panic::AssertUnwindSafe(task).catch_unwind().await;
            let result = match outcome {
                Ok(result) => {
                    if let Err(err) = &result {
                        error!(ticket_id, "queued task failed: {err}");
                    }
                    result
                }
                Err(_) => {
                    error!(ticket_id, "queued task panicked");
                    Err(BridgeError::Queue(QueueError::TaskPanicked))
                }
            };
            // Caller may have gone away; the task's effects stand either way.
            let _ = done_tx.send(result);
        });

        self.enqueue(ticket_id, job)?;
        done_rx
            .await
            .map_err(|_| BridgeError::Queue(QueueError::Closed))?
    }

    fn enqueue(&self, ticket_id: u64, job: Job) -> Result<(), QueueError> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(sender) = map.get(&ticket_id) {
            match sender.send(job) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    // Worker exited between our lookup and the send; replace it.
                    map.remove(&ticket_id);
                    return self.spawn_worker(&mut map, ticket_id, err.0);
                }
            }
        }
        self.spawn_worker(&mut map, ticket_id, job)
    }

    fn spawn_worker(
        &self,
        map: &mut HashMap<u64, UnboundedSender<Job>>,
        ticket_id: u64,
        job: Job,
    ) -> Result<(), QueueError> {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(job).map_err(|_| QueueError::Closed)?;
        map.insert(ticket_id, tx);
        let inner = self.inner.clone();
        tokio::spawn(ticket_worker(ticket_id, rx, inner));
        Ok(())
    }

    /// Number of live per-ticket queues (drained queues are discarded).
    pub fn active_queues(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

async fn ticket_worker(ticket_id: u64, mut rx: UnboundedReceiver<Job>, inner: QueueMap) {
    loop {
        let job = match rx.try_recv() {
            Ok(job) => Some(job),
            Err(TryRecvError::Empty) => {
                // Re-check under the enqueue lock before retiring, so a
                // concurrent enqueue either lands here or spawns fresh.
                let mut map = inner
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match rx.try_recv() {
                    Ok(job) => Some(job),
                    Err(_) => {
                        map.remove(&ticket_id);
                        None
                    }
                }
            }
            Err(TryRecvError::Disconnected) => None,
        };
        match job {
            Some(job) => job.await,
            None => break,
        }
    }
}

/// Global throttle for calls into the chat platform: bounded concurrency
/// plus a fixed ops-per-second cap, shared by every caller regardless of
/// which per-ticket queue originated the work.
pub struct EgressLimiter {
    semaphore: Arc<Semaphore>,
    window: tokio::sync::Mutex<VecDeque<Instant>>,
    max_per_second: u32,
}

impl EgressLimiter {
    pub fn new(max_concurrency: usize, max_per_second: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            window: tokio::sync::Mutex::new(VecDeque::new()),
            max_per_second: max_per_second.max(1),
        }
    }

    /// Wait until both the concurrency slot and the rate window admit one
    /// more operation. The returned permit is held for the operation's
    /// duration; the rate slot is consumed at acquisition.
    pub async fn acquire(&self) -> Result<EgressPermit, QueueError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueueError::Closed)?;

        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                while window
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= Duration::from_secs(1))
                {
                    window.pop_front();
                }
                if window.len() < self.max_per_second as usize {
                    window.push_back(now);
                    None
                } else {
                    window
                        .front()
                        .map(|t| Duration::from_secs(1) - now.duration_since(*t))
                }
            };
            match wait {
                None => return Ok(EgressPermit { _permit: permit }),
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

/// Held for the duration of one egress operation.
pub struct EgressPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn tasks_for_one_ticket_run_in_order() {
        let queues = TicketQueues::new();
        let log: Arc<Mutex<Vec<usize>>> = Arc::default();

        let mut handles = Vec::new();
        for i in 0..20 {
            let queues = queues.clone();
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                queues
                    .run(7, async move {
                        // Yield inside the task; order must still hold.
                        tokio::task::yield_now().await;
                        log.lock().unwrap().push(i);
                        Ok::<_, BridgeError>(())
                    })
                    .await
                    .unwrap();
            }));
            // Enqueue in a known order.
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let seen = log.lock().unwrap().clone();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn different_tickets_run_concurrently() {
        let queues = TicketQueues::new();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        // Ticket 1 blocks until ticket 2 has finished, which only works if
        // the two queues are independent.
        let queues_a = queues.clone();
        let blocked = tokio::spawn(async move {
            queues_a
                .run(1, async move {
                    gate_rx.await.ok();
                    Ok::<_, BridgeError>(())
                })
                .await
        });

        queues
            .run(2, async move {
                gate_tx.send(()).ok();
                Ok::<_, BridgeError>(())
            })
            .await
            .unwrap();
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_task_returns_error_and_queue_survives() {
        let queues = TicketQueues::new();
        let result = queues
            .run(3, async move {
                Err::<(), _>(BridgeError::Other("boom".to_string()))
            })
            .await;
        assert!(result.is_err());

        // Next task on the same ticket still runs.
        let value = queues.run(3, async move { Ok::<_, BridgeError>(41 + 1) }).await;
        assert_eq!(value.unwrap(), 42);
    }

    #[tokio::test]
    async fn panicked_task_does_not_poison_queue() {
        let queues = TicketQueues::new();
        let result = queues
            .run(4, async move {
                panic!("task blew up");
                #[allow(unreachable_code)]
                Ok::<_, BridgeError>(())
            })
            .await;
        assert!(matches!(
            result,
            Err(BridgeError::Queue(QueueError::TaskPanicked))
        ));

        let value = queues.run(4, async move { Ok::<_, BridgeError>(1) }).await;
        assert_eq!(value.unwrap(), 1);
    }

    #[tokio::test]
    async fn idle_queues_are_discarded() {
        let queues = TicketQueues::new();
        queues
            .run(5, async move { Ok::<_, BridgeError>(()) })
            .await
            .unwrap();
        // The worker retires after draining; give it a beat.
        for _ in 0..50 {
            if queues.active_queues() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue for ticket 5 was not discarded");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_cap_delays_excess_operations() {
        let limiter = Arc::new(EgressLimiter::new(10, 2));
        let start = Instant::now();
        for _ in 0..2 {
            let _ = limiter.acquire().await.unwrap();
        }
        // Third acquisition must wait for the window to roll over.
        let _ = limiter.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn concurrency_cap_holds() {
        let limiter = Arc::new(EgressLimiter::new(2, 1000));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
