//! Result aggregator
//!
//! Keeps an ordered event log per request for callers that poll with a
//! cursor or stream events. A request is forgotten once its terminal event was
//! delivered (streamed, or acknowledged by polling past it) or after the
//! delivery timeout. Unfinished requests nobody watches are cancelled.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::execution::{ExecutionEvent, ExecutionResult, RequestId};

/// An event together with its position in the request's log
#[derive(Debug, Clone, Serialize)]
pub struct SequencedEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: ExecutionEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Running,
    Finished,
}

/// Response to a poll
#[derive(Debug, Clone, Serialize)]
pub struct PollSnapshot {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub events: Vec<SequencedEvent>,
    /// Pass back as `cursor` to get only newer events
    pub next_cursor: u64,
    pub result: Option<ExecutionResult>,
}

#[derive(Debug)]
struct TrackedState {
    events: Vec<SequencedEvent>,
    result: Option<ExecutionResult>,
    started: bool,
    finished_at: Option<Instant>,
    last_seen: Instant,
    subscribers: usize,
}

impl TrackedState {
    fn status(&self) -> RequestStatus {
        match (&self.result, self.started) {
            (Some(_), _) => RequestStatus::Finished,
            (None, true) => RequestStatus::Running,
            (None, false) => RequestStatus::Queued,
        }
    }

    fn push(&mut self, event: ExecutionEvent) {
        let seq = self.events.len() as u64;
        self.events.push(SequencedEvent { seq, event });
    }
}

#[derive(Debug)]
struct Tracked {
    cancel: CancellationToken,
    state: Mutex<TrackedState>,
    notify: Notify,
}

impl Tracked {
    fn lock(&self) -> MutexGuard<'_, TrackedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct AggregatorInner {
    entries: DashMap<RequestId, Arc<Tracked>>,
    delivery_timeout: Duration,
    abandon_after: Duration,
}

impl AggregatorInner {
    fn release(&self, id: &RequestId) {
        if self.entries.remove(id).is_some() {
            debug!(request = %id, "released request tracking");
        }
    }
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub abandoned: usize,
}

#[derive(Debug, Clone)]
pub struct ResultAggregator {
    inner: Arc<AggregatorInner>,
}

impl ResultAggregator {
    pub fn new(delivery_timeout: Duration, abandon_after: Duration) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                entries: DashMap::new(),
                delivery_timeout,
                abandon_after,
            }),
        }
    }

    /// Start tracking a request. `cancel` is fired if the caller disconnects.
    pub fn register(&self, id: RequestId, cancel: CancellationToken) {
        let tracked = Tracked {
            cancel,
            state: Mutex::new(TrackedState {
                events: Vec::new(),
                result: None,
                started: false,
                finished_at: None,
                last_seen: Instant::now(),
                subscribers: 0,
            }),
            notify: Notify::new(),
        };
        self.inner.entries.insert(id, Arc::new(tracked));
    }

    /// Stop tracking without delivering anything
    pub fn discard(&self, id: &RequestId) {
        self.inner.entries.remove(id);
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.inner.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn get(&self, id: &RequestId) -> Option<Arc<Tracked>> {
        self.inner.entries.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Append a non-terminal event. Ignored once the request is finished.
    pub fn publish(&self, id: RequestId, event: ExecutionEvent) {
        let Some(tracked) = self.get(&id) else {
            return;
        };
        {
            let mut state = tracked.lock();
            if state.result.is_some() || event.is_terminal() {
                return;
            }
            if matches!(event, ExecutionEvent::Started) {
                state.started = true;
            }
            state.push(event);
        }
        tracked.notify.notify_waiters();
    }

    /// Record the final result. Only the first call has any effect.
    pub fn finish(&self, id: RequestId, result: ExecutionResult) {
        let Some(tracked) = self.get(&id) else {
            return;
        };
        {
            let mut state = tracked.lock();
            if state.result.is_some() {
                return;
            }
            state.push(ExecutionEvent::Finished(result.clone()));
            state.result = Some(result);
            state.finished_at = Some(Instant::now());
        }
        tracked.notify.notify_waiters();
    }

    /// Events from `cursor` on. Polling with a cursor past the terminal event
    /// acknowledges it and releases the request.
    pub fn poll(&self, id: &RequestId, cursor: u64) -> Option<PollSnapshot> {
        let tracked = self.get(id)?;
        let mut state = tracked.lock();
        state.last_seen = Instant::now();

        let total = state.events.len() as u64;
        let from = cursor.min(total) as usize;
        let snapshot = PollSnapshot {
            request_id: *id,
            status: state.status(),
            events: state.events[from..].to_vec(),
            next_cursor: total,
            result: state.result.clone(),
        };

        let acknowledged = state.result.is_some() && cursor >= total;
        drop(state);
        if acknowledged {
            self.inner.release(id);
        }
        Some(snapshot)
    }

    /// Ordered stream of events starting at `from`
    pub fn subscribe(&self, id: &RequestId, from: u64) -> Option<Subscription> {
        let tracked = self.get(id)?;
        {
            let mut state = tracked.lock();
            state.subscribers += 1;
            state.last_seen = Instant::now();
        }
        Some(Subscription {
            id: *id,
            cursor: from as usize,
            tracked,
            aggregator: Arc::clone(&self.inner),
            done: false,
        })
    }

    /// Fire the request's cancellation token
    pub fn cancel(&self, id: &RequestId) -> bool {
        match self.get(id) {
            Some(tracked) => {
                tracked.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Release results nobody collected in time and cancel requests nobody
    /// is watching
    pub fn sweep(&self) -> SweepReport {
        let inner = &self.inner;
        let now = Instant::now();
        let mut report = SweepReport::default();
        let mut expired = Vec::new();

        for entry in inner.entries.iter() {
            let state = entry.value().lock();
            match state.finished_at {
                Some(at) if now.duration_since(at) >= inner.delivery_timeout => {
                    expired.push(*entry.key());
                }
                Some(_) => {}
                None => {
                    let unwatched = state.subscribers == 0
                        && now.duration_since(state.last_seen) >= inner.abandon_after;
                    if unwatched && !entry.value().cancel.is_cancelled() {
                        info!(request = %entry.key(), "caller went away, cancelling request");
                        entry.value().cancel.cancel();
                        report.abandoned += 1;
                    }
                }
            }
        }

        for id in expired {
            inner.release(&id);
            report.expired += 1;
        }
        report
    }
}

/// Live view of one request's events
#[derive(Debug)]
pub struct Subscription {
    id: RequestId,
    cursor: usize,
    tracked: Arc<Tracked>,
    aggregator: Arc<AggregatorInner>,
    done: bool,
}

impl Subscription {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Next event in order, waiting for it if needed. `None` after the
    /// terminal event has been returned.
    pub async fn next(&mut self) -> Option<SequencedEvent> {
        if self.done {
            return None;
        }
        loop {
            let notified = self.tracked.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.tracked.lock();
                state.last_seen = Instant::now();
                if let Some(event) = state.events.get(self.cursor).cloned() {
                    self.cursor += 1;
                    if event.event.is_terminal() {
                        self.done = true;
                        drop(state);
                        self.aggregator.release(&self.id);
                    }
                    return Some(event);
                }
            }

            notified.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.tracked.lock();
        state.subscribers = state.subscribers.saturating_sub(1);
        if state.result.is_none() && state.subscribers == 0 {
            debug!(request = %self.id, "event stream dropped before completion");
            self.tracked.cancel.cancel();
        }
    }
}
