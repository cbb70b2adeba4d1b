//! Scheduler
//!
//! A bounded FIFO of accepted requests drained by a single dispatcher task.
//! The dispatcher hands the oldest pending request a Ready worker of its
//! language and runs it in its own task, so a slow run never holds up the
//! queue. Requests still queued at their end-to-end deadline time out.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::aggregator::ResultAggregator;
use crate::execution::{
    ExecutionEvent, ExecutionRequest, ExecutionResult, OutputChunk, Outcome, RequestId,
};
use crate::limiter::ResourceLimiter;
use crate::pool::{PoolError, WorkerPool};
use crate::quota::{AdmissionGuard, QuotaManager};
use crate::registry::RuntimeRegistry;
use crate::worker::{ExecutionContext, IsolationWorker};

/// Output chunks buffered between a worker and the aggregator
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("queue is full ({capacity} pending requests)")]
    ServiceBusy { capacity: usize },

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// A request waiting for a worker
#[derive(Debug)]
pub struct QueuedJob {
    pub request: ExecutionRequest,
    pub cancel: CancellationToken,
    /// End-to-end deadline of the request
    pub deadline: Instant,
    /// Session concurrency slot, held until the request finishes
    pub admission: AdmissionGuard,
}

struct Pending {
    job: QueuedJob,
    /// Stops the job's cancellation watcher once it leaves the queue
    _dequeued: DropGuard,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub queue_capacity: usize,
    pub running: usize,
    pub completed: u64,
    pub timed_out_in_queue: u64,
}

/// Shared pieces of the execution pipeline
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub registry: Arc<RuntimeRegistry>,
    pub pool: WorkerPool,
    pub limiter: ResourceLimiter,
    pub quota: QuotaManager,
    pub aggregator: ResultAggregator,
    /// Combined stdout + stderr kept per request
    pub output_cap: usize,
}

struct SchedulerInner {
    pipeline: Pipeline,
    queue: Mutex<VecDeque<Pending>>,
    queue_capacity: usize,
    wakeup: Notify,
    running: DashMap<RequestId, CancellationToken>,
    /// Signalled whenever a run finishes
    idle: Notify,
    shutdown: CancellationToken,
    completed: AtomicU64,
    expired: AtomicU64,
}

impl SchedulerInner {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve a request that never reached a worker
    fn resolve_unstarted(&self, job: QueuedJob, outcome: Outcome) {
        let QueuedJob {
            request, admission, ..
        } = job;
        let waited = request.submitted_at.elapsed().unwrap_or_default();
        debug!(request = %request.id, ?outcome, "resolved without running");
        drop(admission);
        self.pipeline.aggregator.finish(
            request.id,
            ExecutionResult::empty(request.id, outcome, waited),
        );
    }

    /// Remove a pending job; `false` if it is not queued
    fn cancel_queued(&self, id: RequestId) -> bool {
        let removed = {
            let mut queue = self.queue();
            queue
                .iter()
                .position(|pending| pending.job.request.id == id)
                .and_then(|index| queue.remove(index))
        };
        match removed {
            Some(pending) => {
                info!(request = %id, "cancelled while queued");
                self.resolve_unstarted(pending.job, Outcome::Cancelled);
                self.wakeup.notify_one();
                true
            }
            None => false,
        }
    }

    /// Drop queued jobs that were cancelled or ran out of time. Returns the
    /// earliest remaining deadline.
    fn purge(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut dropped = Vec::new();
        let earliest = {
            let mut queue = self.queue();
            let mut kept = VecDeque::with_capacity(queue.len());
            for pending in queue.drain(..) {
                if pending.job.cancel.is_cancelled() {
                    dropped.push((pending.job, Outcome::Cancelled));
                } else if pending.job.deadline <= now {
                    dropped.push((pending.job, Outcome::TimedOut));
                } else {
                    kept.push_back(pending);
                }
            }
            *queue = kept;
            queue.iter().map(|pending| pending.job.deadline).min()
        };

        for (job, outcome) in dropped {
            if outcome == Outcome::TimedOut {
                self.expired.fetch_add(1, Ordering::Relaxed);
                warn!(request = %job.request.id, "request timed out while queued");
            }
            self.resolve_unstarted(job, outcome);
        }
        earliest
    }

    fn take(&self, id: RequestId) -> Option<QueuedJob> {
        let mut queue = self.queue();
        let index = queue
            .iter()
            .position(|pending| pending.job.request.id == id)?;
        queue.remove(index).map(|pending| pending.job)
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue_capacity", &self.inner.queue_capacity)
            .field("running", &self.inner.running.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(pipeline: Pipeline, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                pipeline,
                queue: Mutex::new(VecDeque::new()),
                queue_capacity,
                wakeup: Notify::new(),
                running: DashMap::new(),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
                completed: AtomicU64::new(0),
                expired: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the dispatcher loop
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.dispatch().await })
    }

    /// Whether a request would be accepted right now. Admission runs this
    /// before spending quota; [`Scheduler::enqueue`] still has the final say.
    pub fn check_capacity(&self) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        if inner.queue().len() >= inner.queue_capacity {
            return Err(SchedulerError::ServiceBusy {
                capacity: inner.queue_capacity,
            });
        }
        Ok(())
    }

    /// Append a request to the queue and return its position (0 = next).
    /// The request must already be registered with the aggregator.
    pub fn enqueue(&self, job: QueuedJob) -> Result<usize, SchedulerError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }

        let id = job.request.id;
        let cancel = job.cancel.clone();
        let dequeued = CancellationToken::new();
        let position = {
            let mut queue = inner.queue();
            if queue.len() >= inner.queue_capacity {
                return Err(SchedulerError::ServiceBusy {
                    capacity: inner.queue_capacity,
                });
            }
            queue.push_back(Pending {
                job,
                _dequeued: dequeued.clone().drop_guard(),
            });
            let position = queue.len() - 1;
            // Published under the queue lock so it precedes `Started`
            inner
                .pipeline
                .aggregator
                .publish(id, ExecutionEvent::Queued { position });
            position
        };
        debug!(request = %id, position, "queued");

        let watcher = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    watcher.cancel_queued(id);
                }
                _ = dequeued.cancelled() => {}
            }
        });

        inner.wakeup.notify_one();
        Ok(position)
    }

    /// Position of a pending request, `None` once it left the queue
    pub fn queue_position(&self, id: &RequestId) -> Option<usize> {
        self.inner
            .queue()
            .iter()
            .position(|pending| pending.job.request.id == *id)
    }

    /// Cancel a request: dropped if still queued, killed if running
    pub fn cancel(&self, id: &RequestId) -> bool {
        if self.inner.cancel_queued(*id) {
            return true;
        }
        match self.inner.running.get(id) {
            Some(token) => {
                info!(request = %id, "cancelling running request");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let inner = &self.inner;
        SchedulerStats {
            queued: inner.queue().len(),
            queue_capacity: inner.queue_capacity,
            running: inner.running.len(),
            completed: inner.completed.load(Ordering::Relaxed),
            timed_out_in_queue: inner.expired.load(Ordering::Relaxed),
        }
    }

    /// Stop dispatching, cancel everything queued or running, wait up to
    /// `grace` for runs to wind down and tear the pool down.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        inner.shutdown.cancel();

        let pending: Vec<_> = inner.queue().drain(..).collect();
        info!(
            queued = pending.len(),
            running = inner.running.len(),
            "shutting down scheduler"
        );
        for pending in pending {
            inner.resolve_unstarted(pending.job, Outcome::Cancelled);
        }
        for entry in inner.running.iter() {
            entry.value().cancel();
        }

        let deadline = Instant::now() + grace;
        loop {
            let mut idle = pin!(inner.idle.notified());
            idle.as_mut().enable();
            if inner.running.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                warn!(running = inner.running.len(), "runs still active after shutdown grace");
                break;
            }
        }
        inner.pipeline.pool.shutdown().await;
    }

    async fn dispatch(&self) {
        let inner = &self.inner;
        info!(capacity = inner.queue_capacity, "dispatcher started");

        loop {
            if inner.shutdown.is_cancelled() {
                break;
            }
            let earliest = inner.purge();
            let head = inner.queue().front().map(|pending| {
                (
                    pending.job.request.id,
                    pending.job.request.language.clone(),
                    pending.job.cancel.clone(),
                )
            });

            let Some((id, language, cancel)) = head else {
                tokio::select! {
                    _ = inner.wakeup.notified() => {}
                    _ = inner.shutdown.cancelled() => break,
                }
                continue;
            };
            let deadline = earliest.unwrap_or_else(Instant::now);

            let checkout = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => break,
                _ = cancel.cancelled() => continue,
                _ = tokio::time::sleep_until(deadline) => continue,
                checkout = inner.pipeline.pool.checkout(&language) => checkout,
            };

            match checkout {
                Ok(worker) => match inner.take(id) {
                    Some(job) => self.launch(job, worker),
                    None => inner.pipeline.pool.restore(worker),
                },
                Err(PoolError::Closed) => break,
                Err(e) => {
                    error!(request = %id, error = %e, "could not obtain a sandbox");
                    if let Some(job) = inner.take(id) {
                        inner.resolve_unstarted(job, Outcome::InternalError);
                    }
                }
            }
        }
        info!("dispatcher stopped");
    }

    fn launch(&self, job: QueuedJob, worker: IsolationWorker) {
        let inner = Arc::clone(&self.inner);
        let QueuedJob {
            request,
            cancel,
            deadline,
            admission,
        } = job;
        let id = request.id;

        inner.running.insert(id, cancel.clone());
        inner.pipeline.aggregator.publish(id, ExecutionEvent::Started);
        let queued_for = request.submitted_at.elapsed().unwrap_or_default();
        info!(request = %id, language = %request.language, worker = %worker.id(), ?queued_for, "dispatching");

        tokio::spawn(async move {
            let pipeline = &inner.pipeline;
            let result = match pipeline.registry.profile(&request.language) {
                Some(profile) => {
                    let (tx, mut rx) = mpsc::channel::<OutputChunk>(OUTPUT_CHANNEL_CAPACITY);
                    let aggregator = pipeline.aggregator.clone();
                    let relay = tokio::spawn(async move {
                        while let Some(chunk) = rx.recv().await {
                            aggregator.publish(id, chunk.into());
                        }
                    });

                    let ctx = ExecutionContext {
                        output: tx,
                        cancel,
                        deadline,
                        output_cap: pipeline.output_cap,
                    };
                    let result = worker
                        .execute(&request, &profile, &pipeline.limiter, ctx)
                        .await;
                    if let Err(e) = relay.await {
                        warn!(request = %id, error = %e, "output relay task failed");
                    }
                    result
                }
                None => {
                    error!(request = %id, language = %request.language, "no runtime profile");
                    worker.retire().await;
                    ExecutionResult::empty(id, Outcome::InternalError, Duration::ZERO)
                }
            };

            info!(
                request = %id,
                outcome = ?result.outcome,
                exit_code = ?result.exit_code,
                duration_ms = result.duration.as_millis() as u64,
                truncated = result.truncated,
                "request finished"
            );
            pipeline
                .quota
                .record_outcome(&request.client_session_id, result.outcome);
            drop(admission);
            inner.running.remove(&id);
            inner.completed.fetch_add(1, Ordering::Relaxed);
            pipeline.aggregator.finish(id, result);
            inner.idle.notify_waiters();
            pipeline.pool.replenish(&request.language);
        });
    }
}

/// Deadline for a request submitted at `submitted_at` with `timeout` to go
pub fn end_to_end_deadline(submitted_at: SystemTime, timeout: Duration) -> Instant {
    let waited = submitted_at.elapsed().unwrap_or_default();
    Instant::now() + timeout.saturating_sub(waited)
}
