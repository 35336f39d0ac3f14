//! Resource pool: bounded set of reusable execution contexts.
//!
//! Contexts are created on demand up to `max_resources` and handed out
//! through [`PoolGuard`]s. Dropping a guard returns its context to the pool
//! (or straight to the next waiter); [`PoolGuard::evict`] discards a broken
//! context and frees its capacity. When the pool is full, callers queue
//! for up to `acquire_timeout` before failing with
//! [`PoolError::ResourceTimeout`].
//!
//! Every release path is synchronous so that a check abandoned mid-flight
//! still returns its lease when its future is dropped.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use probegrid_core::BoxFuture;

use crate::lock;

/// Creates and closes pooled resources.
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    fn create(&self) -> BoxFuture<'_, anyhow::Result<Self::Resource>>;

    fn close(&self, resource: Self::Resource) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Configuration for a resource pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of live resources (idle + leased).
    pub max_resources: usize,
    /// How long a caller waits for capacity before giving up.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_resources: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Errors returned by [`ResourcePool::acquire`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("timed out after {}ms waiting for a pooled resource", .0.as_millis())]
    ResourceTimeout(Duration),

    #[error("resource pool is shut down")]
    Closed,

    #[error("failed to create resource: {0}")]
    Create(String),
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live resources, including ones being created.
    pub size: usize,
    pub capacity: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub created: u64,
    pub evicted: u64,
    pub timeouts: u64,
}

struct Pooled<R> {
    id: u64,
    resource: R,
}

/// What a releasing caller passes to a queued waiter.
enum Handoff<R> {
    /// An idle resource, ready to use.
    Ready(Pooled<R>),
    /// Freed capacity; the waiter creates its own resource.
    Slot,
}

struct PoolState<R> {
    idle: VecDeque<Pooled<R>>,
    /// Live resources: idle, leased, and reserved for creation.
    total: usize,
    waiters: VecDeque<oneshot::Sender<Handoff<R>>>,
    closed: bool,
}

struct Inner<F: ResourceFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Resource>>,
    next_id: AtomicU64,
    evicted: AtomicU64,
    timeouts: AtomicU64,
}

impl<F: ResourceFactory> Inner<F> {
    /// Return a resource: to the first live waiter, else to the idle list.
    fn release(self: &Arc<Self>, pooled: Pooled<F::Resource>) {
        let mut st = lock(&self.state);
        if st.closed {
            st.total -= 1;
            drop(st);
            self.close_detached(pooled);
            return;
        }

        let mut handoff = Handoff::Ready(pooled);
        while let Some(tx) = st.waiters.pop_front() {
            match tx.send(handoff) {
                Ok(()) => return,
                Err(back) => handoff = back,
            }
        }
        if let Handoff::Ready(pooled) = handoff {
            debug!(resource_id = pooled.id, "resource returned to pool");
            st.idle.push_back(pooled);
        }
    }

    /// Give a unit of capacity to the next waiter, or shrink the pool.
    fn free_slot(&self) {
        let mut st = lock(&self.state);
        if !st.closed {
            let mut handoff = Handoff::Slot;
            while let Some(tx) = st.waiters.pop_front() {
                match tx.send(handoff) {
                    Ok(()) => return,
                    Err(back) => handoff = back,
                }
            }
        }
        st.total -= 1;
    }

    fn evict(self: &Arc<Self>, pooled: Pooled<F::Resource>) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
        warn!(resource_id = pooled.id, "evicting unhealthy resource");
        self.close_detached(pooled);
        self.free_slot();
    }

    fn give_back(self: &Arc<Self>, handoff: Handoff<F::Resource>) {
        match handoff {
            Handoff::Ready(pooled) => self.release(pooled),
            Handoff::Slot => self.free_slot(),
        }
    }

    /// Close a resource on a background task; failures are logged.
    fn close_detached(self: &Arc<Self>, pooled: Pooled<F::Resource>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(self);
        handle.spawn(async move {
            if let Err(e) = inner.factory.close(pooled.resource).await {
                warn!(resource_id = pooled.id, error = %e, "failed to close resource");
            }
        });
    }
}

/// Bounded pool of reusable resources. Cheap to clone.
pub struct ResourcePool<F: ResourceFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: ResourceFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ResourceFactory> ResourcePool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
                next_id: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
            }),
        }
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.max_resources
    }

    /// Lease a resource.
    ///
    /// Reuses an idle resource if one exists, creates one if under capacity,
    /// and otherwise queues behind earlier callers.
    pub async fn acquire(&self) -> Result<PoolGuard<F>, PoolError> {
        let rx = {
            let mut st = lock(&self.inner.state);
            if st.closed {
                return Err(PoolError::Closed);
            }
            if let Some(pooled) = st.idle.pop_front() {
                debug!(resource_id = pooled.id, "acquired idle resource");
                return Ok(self.guard(pooled));
            }
            if st.total < self.inner.config.max_resources {
                st.total += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(tx);
                debug!(waiting = st.waiters.len(), "pool at capacity, queueing");
                Some(rx)
            }
        };

        match rx {
            None => self.create_reserved(Reservation::new(&self.inner)).await,
            Some(rx) => self.wait(rx).await,
        }
    }

    /// Return a resource to the pool. Equivalent to dropping the guard.
    pub fn release(&self, guard: PoolGuard<F>) {
        drop(guard);
    }

    async fn wait(&self, rx: oneshot::Receiver<Handoff<F::Resource>>) -> Result<PoolGuard<F>, PoolError> {
        let timeout = self.inner.config.acquire_timeout;
        let mut waiter = Waiter {
            rx,
            inner: Arc::clone(&self.inner),
        };

        match tokio::time::timeout(timeout, &mut waiter.rx).await {
            Ok(Ok(Handoff::Ready(pooled))) => {
                debug!(resource_id = pooled.id, "acquired resource from releasing caller");
                Ok(self.guard(pooled))
            }
            Ok(Ok(Handoff::Slot)) => self.create_reserved(Reservation::new(&self.inner)).await,
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(timeout_ms = timeout.as_millis() as u64, "timed out waiting for pooled resource");
                Err(PoolError::ResourceTimeout(timeout))
            }
        }
    }

    async fn create_reserved(&self, mut reservation: Reservation<F>) -> Result<PoolGuard<F>, PoolError> {
        match self.inner.factory.create().await {
            Ok(resource) => {
                reservation.armed = false;
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                debug!(resource_id = id, "created new resource");
                Ok(self.guard(Pooled { id, resource }))
            }
            Err(e) => {
                warn!(error = %e, "failed to create resource");
                Err(PoolError::Create(format!("{e:#}")))
            }
        }
    }

    fn guard(&self, pooled: Pooled<F::Resource>) -> PoolGuard<F> {
        PoolGuard {
            pooled: Some(pooled),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Fail all queued waiters and close every idle resource.
    ///
    /// Leased resources are closed when their guards drop. Close failures
    /// are logged, not returned.
    pub async fn shutdown(&self) {
        let (idle, waiters) = {
            let mut st = lock(&self.inner.state);
            if st.closed {
                return;
            }
            st.closed = true;
            let idle: Vec<_> = st.idle.drain(..).collect();
            st.total -= idle.len();
            let waiters: Vec<_> = st.waiters.drain(..).collect();
            (idle, waiters)
        };

        let failed_waiters = waiters.len();
        drop(waiters);

        let closing = idle.len();
        let mut set = JoinSet::new();
        for pooled in idle {
            let inner = Arc::clone(&self.inner);
            set.spawn(async move {
                let id = pooled.id;
                (id, inner.factory.close(pooled.resource).await)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => warn!(resource_id = id, error = %e, "failed to close resource"),
                Err(e) => warn!(error = %e, "resource close task failed"),
            }
        }

        info!(closed = closing, failed_waiters, "resource pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let st = lock(&self.inner.state);
        PoolStats {
            size: st.total,
            capacity: self.inner.config.max_resources,
            idle: st.idle.len(),
            in_use: st.total - st.idle.len(),
            waiting: st.waiters.len(),
            created: self.inner.next_id.load(Ordering::Relaxed),
            evicted: self.inner.evicted.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Capacity reserved for a resource being created; freed if creation
/// fails or the acquiring future is dropped.
struct Reservation<F: ResourceFactory> {
    inner: Arc<Inner<F>>,
    armed: bool,
}

impl<F: ResourceFactory> Reservation<F> {
    fn new(inner: &Arc<Inner<F>>) -> Self {
        Self {
            inner: Arc::clone(inner),
            armed: true,
        }
    }
}

impl<F: ResourceFactory> Drop for Reservation<F> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.free_slot();
        }
    }
}

/// Queued acquire; recovers a handoff that races with cancellation.
struct Waiter<F: ResourceFactory> {
    rx: oneshot::Receiver<Handoff<F::Resource>>,
    inner: Arc<Inner<F>>,
}

impl<F: ResourceFactory> Drop for Waiter<F> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(handoff) = self.rx.try_recv() {
            self.inner.give_back(handoff);
        }
    }
}

/// A leased resource. Returned to the pool on drop.
pub struct PoolGuard<F: ResourceFactory> {
    pooled: Option<Pooled<F::Resource>>,
    inner: Arc<Inner<F>>,
}

impl<F: ResourceFactory> PoolGuard<F> {
    pub fn id(&self) -> u64 {
        self.pooled.as_ref().map_or(0, |p| p.id)
    }

    /// Discard this resource as unhealthy, freeing its capacity.
    pub fn evict(mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.inner.evict(pooled);
        }
    }
}

impl<F: ResourceFactory> Deref for PoolGuard<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        match &self.pooled {
            Some(p) => &p.resource,
            None => unreachable!("pool guard used after release"),
        }
    }
}

impl<F: ResourceFactory> DerefMut for PoolGuard<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.pooled {
            Some(p) => &mut p.resource,
            None => unreachable!("pool guard used after release"),
        }
    }
}

impl<F: ResourceFactory> Drop for PoolGuard<F> {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.inner.release(pooled);
        }
    }
}
