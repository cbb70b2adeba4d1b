//! Warm worker pool
//!
//! Every live worker holds one capacity permit and one box slot, so the number
//! of sandboxes never exceeds `max_workers` and no two live sandboxes share a
//! box id. Ready workers are kept per language and topped up in the
//! background; a language without a Ready worker gets a cold start, or the
//! pool evicts an idle worker of another language to make room.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;
use crate::registry::LanguageId;
use crate::sandbox::SandboxBackend;
use crate::worker::{IsolationWorker, WorkerError};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,

    #[error(transparent)]
    Warmup(#[from] WorkerError),

    #[error("warm-up task for {0} was aborted")]
    Aborted(LanguageId),
}

/// Box ids not held by a live worker, plus the wakeup for anyone waiting on
/// capacity or on a worker to become Ready
#[derive(Debug)]
struct Slots {
    free: Mutex<Vec<u32>>,
    notify: Notify,
}

/// One unit of pool capacity: a semaphore permit and a box slot.
/// Both are returned when the owning worker is dropped.
#[derive(Debug)]
pub struct Capacity {
    slot: u32,
    permit: Option<OwnedSemaphorePermit>,
    home: Option<Arc<Slots>>,
}

impl Capacity {
    /// Capacity outside any pool, for one-off runs
    pub fn standalone(slot: u32) -> Self {
        Self {
            slot,
            permit: None,
            home: None,
        }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl Drop for Capacity {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            home.free
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(self.slot);
            drop(self.permit.take());
            home.notify.notify_waiters();
        }
    }
}

#[derive(Debug, Default)]
struct LanguagePool {
    ready: VecDeque<IsolationWorker>,
    warming: usize,
}

/// Point-in-time view of the pool, reported by `/health`
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_workers: usize,
    pub ready: usize,
    pub warming: usize,
    pub executing: usize,
    pub available: usize,
}

#[derive(Debug)]
struct PoolInner {
    backend: Arc<dyn SandboxBackend>,
    semaphore: Arc<Semaphore>,
    slots: Arc<Slots>,
    languages: DashMap<LanguageId, LanguagePool>,
    max_workers: usize,
    target_ready: usize,
    /// Checkouts currently waiting; background warm-up yields to them
    demand: AtomicUsize,
    /// Evicted workers whose sandboxes are still being destroyed
    evicting: Arc<AtomicUsize>,
    closed: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct DemandGuard<'a>(&'a AtomicUsize);

impl<'a> DemandGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for DemandGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        config: &PoolConfig,
        languages: impl IntoIterator<Item = LanguageId>,
    ) -> Self {
        let max_workers = config.max_workers as usize;
        // Popped from the back, so the lowest ids are handed out first
        let free = (0..config.max_workers)
            .rev()
            .map(|i| config.first_box_id + i)
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                backend,
                semaphore: Arc::new(Semaphore::new(max_workers)),
                slots: Arc::new(Slots {
                    free: Mutex::new(free),
                    notify: Notify::new(),
                }),
                languages: languages
                    .into_iter()
                    .map(|id| (id, LanguagePool::default()))
                    .collect(),
                max_workers,
                target_ready: config.target_ready,
                demand: AtomicUsize::new(0),
                evicting: Arc::new(AtomicUsize::new(0)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Start the initial warm-up for every language
    pub fn prewarm(&self) {
        let languages: Vec<_> = self
            .inner
            .languages
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        info!(
            languages = languages.len(),
            target_ready = self.inner.target_ready,
            backend = self.inner.backend.name(),
            "warming worker pool"
        );
        for language in languages {
            self.replenish(&language);
        }
    }

    /// Get a Ready worker for `language`, waiting for capacity if needed.
    ///
    /// Cancel-safe: a worker still warming when the caller goes away is
    /// parked as Ready instead of being lost.
    #[instrument(skip(self), fields(language = %language))]
    pub async fn checkout(&self, language: &LanguageId) -> Result<IsolationWorker, PoolError> {
        let inner = &self.inner;
        let _demand = DemandGuard::new(&inner.demand);

        loop {
            let mut notified = pin!(inner.slots.notify.notified());
            notified.as_mut().enable();

            if inner.closed.load(Ordering::SeqCst) {
                return Err(PoolError::Closed);
            }
            if let Some(worker) = self.take_ready(language) {
                debug!(worker = %worker.id(), "warm checkout");
                return Ok(worker);
            }
            if let Some(capacity) = self.reserve() {
                debug!(slot = capacity.slot(), "cold start");
                return self.cold_start(language, capacity).await;
            }
            // Capacity comes back once the evicted sandbox is gone
            self.evict_idle(language);

            notified.await;
        }
    }

    /// Put back a Ready worker that was checked out but never used
    pub fn restore(&self, worker: IsolationWorker) {
        park(&self.inner, worker, false);
    }

    /// Top `language` back up to `target_ready` in the background
    pub fn replenish(&self, language: &LanguageId) {
        let inner = &self.inner;
        loop {
            if inner.closed.load(Ordering::SeqCst) || inner.demand.load(Ordering::SeqCst) > 0 {
                return;
            }
            {
                let Some(mut pool) = inner.languages.get_mut(language) else {
                    return;
                };
                if pool.ready.len() + pool.warming >= inner.target_ready {
                    return;
                }
                let Some(capacity) = self.reserve() else {
                    return;
                };
                pool.warming += 1;
                self.spawn_warm(language.clone(), capacity, None);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let (ready, warming) = inner
            .languages
            .iter()
            .fold((0, 0), |(ready, warming), entry| {
                (ready + entry.ready.len(), warming + entry.warming)
            });
        let available = inner.semaphore.available_permits();
        let in_use = inner.max_workers.saturating_sub(available);
        PoolStats {
            max_workers: inner.max_workers,
            ready,
            warming,
            executing: in_use.saturating_sub(ready + warming),
            available,
        }
    }

    /// Stop handing out workers and destroy every idle one
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.slots.notify.notify_waiters();

        let mut idle = Vec::new();
        for mut entry in inner.languages.iter_mut() {
            idle.extend(entry.ready.drain(..));
        }
        info!(idle = idle.len(), "shutting down worker pool");
        for worker in idle {
            worker.retire().await;
        }
    }

    fn take_ready(&self, language: &LanguageId) -> Option<IsolationWorker> {
        self.inner
            .languages
            .get_mut(language)
            .and_then(|mut pool| pool.ready.pop_front())
    }

    fn reserve(&self) -> Option<Capacity> {
        let inner = &self.inner;
        let permit = Arc::clone(&inner.semaphore).try_acquire_owned().ok()?;
        let slot = inner
            .slots
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()?;
        Some(Capacity {
            slot,
            permit: Some(permit),
            home: Some(Arc::clone(&inner.slots)),
        })
    }

    /// Destroy one idle worker of another language, unless an eviction is
    /// already under way
    fn evict_idle(&self, wanted: &LanguageId) {
        let inner = &self.inner;
        if inner.evicting.load(Ordering::SeqCst) > 0 {
            return;
        }
        let victim = inner
            .languages
            .iter_mut()
            .filter(|entry| entry.key() != wanted)
            .find_map(|mut entry| entry.ready.pop_back());
        if let Some(worker) = victim {
            debug!(worker = %worker.id(), language = %worker.language(), "evicting idle worker");
            let evicting = Arc::clone(&inner.evicting);
            evicting.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                worker.retire().await;
                evicting.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn cold_start(
        &self,
        language: &LanguageId,
        capacity: Capacity,
    ) -> Result<IsolationWorker, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.spawn_warm(language.clone(), capacity, Some(tx));
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Aborted(language.clone())),
        }
    }

    /// Warm a worker in its own task. With `deliver` the worker goes to the
    /// waiting caller (or is parked if the caller left); without, it is
    /// counted as warming and parked.
    fn spawn_warm(
        &self,
        language: LanguageId,
        capacity: Capacity,
        deliver: Option<oneshot::Sender<Result<IsolationWorker, PoolError>>>,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut worker = IsolationWorker::new(language.clone(), capacity);
            let warmed = worker.warm(inner.backend.as_ref()).await;

            match (warmed, deliver) {
                (Ok(()), Some(tx)) => {
                    if let Err(Ok(worker)) = tx.send(Ok(worker)) {
                        park(&inner, worker, false);
                    }
                }
                (Err(e), Some(tx)) => {
                    drop(worker);
                    let _ = tx.send(Err(e.into()));
                }
                (Ok(()), None) => park(&inner, worker, true),
                (Err(e), None) => {
                    warn!(language = %language, error = %e, "background warm-up failed");
                    if let Some(mut pool) = inner.languages.get_mut(&language) {
                        pool.warming = pool.warming.saturating_sub(1);
                    }
                    drop(worker);
                }
            }
        });
    }
}

/// Make a Ready worker available, or destroy it if the pool is closed
fn park(inner: &PoolInner, worker: IsolationWorker, was_warming: bool) {
    let language = worker.language().clone();
    let rejected = match inner.languages.get_mut(&language) {
        Some(mut pool) => {
            if was_warming {
                pool.warming = pool.warming.saturating_sub(1);
            }
            if inner.closed.load(Ordering::SeqCst) {
                Some(worker)
            } else {
                pool.ready.push_back(worker);
                None
            }
        }
        None => Some(worker),
    };

    match rejected {
        Some(worker) => {
            tokio::spawn(worker.retire());
        }
        None => {
            debug!(language = %language, "worker ready");
            inner.slots.notify.notify_waiters();
        }
    }
}
