//! Priority-ordered admission control.
//!
//! At most `max_concurrency` permits exist at once. Callers that find the
//! limiter full are queued by `(priority rank, arrival sequence)`, so higher
//! priority work overtakes queued lower priority work while equal
//! priorities keep arrival order. Running work is never preempted.
//!
//! Admission is split in two steps: [`ConcurrencyLimiter::reserve`] takes a
//! place in line synchronously, and [`Ticket::admitted`] waits for the
//! permit. Reserving in submission order before spawning keeps the queue
//! order deterministic. A freed permit is handed directly to the next
//! queued ticket, so the active count never overshoots.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info};

use probegrid_core::Priority;

use crate::error::{LimiterError, LimiterResult};

type QueueKey = (u8, u64);

struct State {
    active: usize,
    queue: BTreeMap<QueueKey, oneshot::Sender<()>>,
    next_seq: u64,
    closed: bool,
    completed: u64,
    peak_active: usize,
}

struct Inner {
    max_concurrency: usize,
    state: Mutex<State>,
    drained: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Give a finished permit's slot to the next queued ticket.
    fn release(&self) {
        let mut st = self.state();
        st.completed += 1;
        while let Some((key, tx)) = st.queue.pop_first() {
            if tx.send(()).is_ok() {
                debug!(rank = key.0, seq = key.1, "permit handed to queued job");
                return;
            }
        }
        st.active -= 1;
        let idle = st.active == 0;
        drop(st);
        if idle {
            self.drained.notify_waiters();
        }
    }
}

/// Point-in-time limiter statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub max_concurrency: usize,
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
    pub peak_active: usize,
    pub closed: bool,
}

/// Bounds the number of simultaneously running jobs. Cheap to clone.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<Inner>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_concurrency: max_concurrency.max(1),
                state: Mutex::new(State {
                    active: 0,
                    queue: BTreeMap::new(),
                    next_seq: 0,
                    closed: false,
                    completed: 0,
                    peak_active: 0,
                }),
                drained: Notify::new(),
            }),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Take a place in line.
    ///
    /// Runs immediately when a slot is free and nobody is queued; otherwise
    /// the ticket is queued behind every earlier ticket of equal or higher
    /// priority.
    pub fn reserve(&self, priority: Priority) -> LimiterResult<Ticket> {
        let mut st = self.inner.state();
        if st.closed {
            return Err(LimiterError::Closed);
        }

        if st.active < self.inner.max_concurrency && st.queue.is_empty() {
            st.active += 1;
            st.peak_active = st.peak_active.max(st.active);
            return Ok(Ticket {
                inner: Arc::clone(&self.inner),
                state: TicketState::Ready,
            });
        }

        let key = (priority.rank(), st.next_seq);
        st.next_seq += 1;
        let (tx, rx) = oneshot::channel();
        st.queue.insert(key, tx);
        debug!(%priority, queued = st.queue.len(), "job queued");
        Ok(Ticket {
            inner: Arc::clone(&self.inner),
            state: TicketState::Queued { key, rx },
        })
    }

    /// Run `job` once admitted. The permit is released when it finishes,
    /// whatever the outcome.
    pub async fn execute<F, T>(&self, priority: Priority, job: F) -> LimiterResult<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self.reserve(priority)?.admitted().await?;
        Ok(job.await)
    }

    /// Refuse new work. Queued and running jobs still complete.
    pub fn close(&self) {
        let mut st = self.inner.state();
        if !st.closed {
            st.closed = true;
            info!(active = st.active, queued = st.queue.len(), "concurrency limiter closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Whether nothing is running or queued.
    pub fn is_idle(&self) -> bool {
        let st = self.inner.state();
        st.active == 0 && st.queue.is_empty()
    }

    /// Wait until no job is running or queued.
    pub async fn wait_for_drain(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> LimiterStats {
        let st = self.inner.state();
        LimiterStats {
            max_concurrency: self.inner.max_concurrency,
            active: st.active,
            queued: st.queue.len(),
            completed: st.completed,
            peak_active: st.peak_active,
            closed: st.closed,
        }
    }
}

enum TicketState {
    Ready,
    Queued {
        key: QueueKey,
        rx: oneshot::Receiver<()>,
    },
    Done,
}

/// A place in the limiter's line. Dropping it gives up the place, or the
/// permit if one was already handed over.
pub struct Ticket {
    inner: Arc<Inner>,
    state: TicketState,
}

impl Ticket {
    /// Whether the ticket was admitted without queueing.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, TicketState::Ready)
    }

    /// Wait for admission.
    pub async fn admitted(mut self) -> LimiterResult<Permit> {
        if let TicketState::Queued { rx, .. } = &mut self.state {
            if rx.await.is_err() {
                self.state = TicketState::Done;
                return Err(LimiterError::Closed);
            }
        }
        self.state = TicketState::Done;
        Ok(Permit {
            inner: Some(Arc::clone(&self.inner)),
        })
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.state, TicketState::Done) {
            TicketState::Done => {}
            TicketState::Ready => self.inner.release(),
            TicketState::Queued { key, mut rx } => {
                let removed = self.inner.state().queue.remove(&key).is_some();
                if !removed {
                    // Already handed a permit; pass it on.
                    rx.close();
                    if rx.try_recv().is_ok() {
                        self.inner.release();
                    }
                }
            }
        }
    }
}

/// Proof of admission. The slot is released on drop.
pub struct Permit {
    inner: Option<Arc<Inner>>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // ── Admission ────────────────────────────────────────────────────

    #[tokio::test]
    async fn runs_immediately_under_limit() {
        let limiter = ConcurrencyLimiter::new(2);
        let out = limiter.execute(Priority::Low, async { 42 }).await;
        assert_eq!(out, Ok(42));
        let stats = limiter.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn first_two_admitted_third_queued() {
        let limiter = ConcurrencyLimiter::new(2);
        let low = limiter.reserve(Priority::Low).unwrap();
        let high = limiter.reserve(Priority::High).unwrap();
        let normal = limiter.reserve(Priority::Medium).unwrap();

        assert!(low.is_ready());
        assert!(high.is_ready());
        assert!(!normal.is_ready());
        assert_eq!(limiter.stats().queued, 1);

        let low = low.admitted().await.unwrap();
        drop(low);
        let _normal = normal.admitted().await.unwrap();
        assert_eq!(limiter.stats().active, 2);
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_arrival() {
        let limiter = ConcurrencyLimiter::new(1);
        let blocker = limiter.reserve(Priority::Low).unwrap().admitted().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (label, priority) in [
            ("low-1", Priority::Low),
            ("medium-1", Priority::Medium),
            ("high-1", Priority::High),
            ("low-2", Priority::Low),
            ("high-2", Priority::High),
        ] {
            let ticket = limiter.reserve(priority).unwrap();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = ticket.admitted().await.unwrap();
                order.lock().unwrap().push(label);
            }));
        }

        drop(blocker);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(
            *order.lock().unwrap(),
            vec!["high-1", "high-2", "medium-1", "low-1", "low-2"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_max_concurrency() {
        let limiter = ConcurrencyLimiter::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..60 {
            let priority = match i % 3 {
                0 => Priority::High,
                1 => Priority::Medium,
                _ => Priority::Low,
            };
            let ticket = limiter.reserve(priority).unwrap();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = ticket.admitted().await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let stats = limiter.stats();
        assert!(stats.peak_active <= 3);
        assert_eq!(stats.completed, 60);
        assert!(limiter.is_idle());
    }

    #[tokio::test]
    async fn failed_job_still_releases_slot() {
        let limiter = ConcurrencyLimiter::new(1);
        let out: LimiterResult<Result<(), &str>> =
            limiter.execute(Priority::High, async { Err("probe down") }).await;
        assert_eq!(out, Ok(Err("probe down")));
        assert_eq!(limiter.stats().active, 0);
    }

    // ── Cancellation ─────────────────────────────────────────────────

    #[tokio::test]
    async fn dropped_ticket_leaves_queue() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.reserve(Priority::High).unwrap();
        let queued = limiter.reserve(Priority::Low).unwrap();
        assert_eq!(limiter.stats().queued, 1);

        drop(queued);
        assert_eq!(limiter.stats().queued, 0);
        drop(held);
        assert!(limiter.is_idle());
    }

    #[tokio::test]
    async fn ticket_dropped_after_handoff_passes_permit_on() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.reserve(Priority::High).unwrap();
        let first = limiter.reserve(Priority::Medium).unwrap();
        let second = limiter.reserve(Priority::Medium).unwrap();

        // The permit moves to `first`, which is dropped before being polled.
        drop(held);
        drop(first);
        let stats = limiter.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.queued, 0);

        drop(second.admitted().await.unwrap());
        assert!(limiter.is_idle());
    }

    // ── Close and drain ──────────────────────────────────────────────

    #[tokio::test]
    async fn closed_limiter_rejects_new_work() {
        let limiter = ConcurrencyLimiter::new(2);
        limiter.close();
        assert!(limiter.is_closed());
        assert_eq!(limiter.reserve(Priority::High).err(), Some(LimiterError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_drain_waits_for_queued_work() {
        let limiter = ConcurrencyLimiter::new(1);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ticket = limiter.reserve(Priority::Medium).unwrap();
            let done = done.clone();
            tokio::spawn(async move {
                let _permit = ticket.admitted().await.unwrap();
                tokio::time::sleep(Duration::from_secs(1)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        limiter.close();
        limiter.wait_for_drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn wait_for_drain_returns_when_idle() {
        let limiter = ConcurrencyLimiter::new(1);
        limiter.wait_for_drain().await;
    }
}
