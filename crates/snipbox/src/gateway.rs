//! Execution gateway
//!
//! The validation boundary in front of the pipeline. It resolves the language,
//! enforces payload ceilings and quotas, registers the request for result
//! delivery and queues it. It never runs code itself.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::aggregator::{PollSnapshot, ResultAggregator, Subscription};
use crate::config::{Config, GatewayConfig};
use crate::execution::{ExecutionRequest, RequestId, SessionId};
use crate::limiter::ResourceLimiter;
use crate::pool::{PoolStats, WorkerPool};
use crate::quota::{Admission, QuotaManager, SessionQuota};
use crate::registry::{LanguageSummary, RegistryError, RuntimeRegistry};
use crate::sandbox::SandboxBackend;
use crate::scheduler::{
    Pipeline, QueuedJob, Scheduler, SchedulerError, SchedulerStats, end_to_end_deadline,
};

/// How often finished results, abandoned requests and idle sessions are swept
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unsupported language '{0}'")]
    InvalidLanguage(String),

    #[error("{field} is {size} bytes, the limit is {limit}")]
    PayloadTooLarge {
        field: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("too many requests, retry in {}s", retry_after.as_secs_f64().ceil())]
    Throttled { retry_after: Duration },

    #[error("session is temporarily blocked")]
    Rejected { retry_after: Duration },

    #[error("too many pending requests, try again later")]
    ServiceBusy,

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("unknown request {0}")]
    NotFound(RequestId),
}

impl From<SchedulerError> for GatewayError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::ServiceBusy { .. } => GatewayError::ServiceBusy,
            SchedulerError::ShuttingDown => GatewayError::ShuttingDown,
        }
    }
}

/// Handle returned for an accepted submission
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Submission {
    pub request_id: RequestId,
    pub queue_position: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub pool: PoolStats,
    pub scheduler: SchedulerStats,
    pub tracked_requests: usize,
    pub tracked_sessions: usize,
}

#[derive(Debug)]
struct GatewayInner {
    config: GatewayConfig,
    registry: Arc<RuntimeRegistry>,
    pool: WorkerPool,
    quota: QuotaManager,
    aggregator: ResultAggregator,
    scheduler: Scheduler,
    stop: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct ExecutionGateway {
    inner: Arc<GatewayInner>,
}

impl ExecutionGateway {
    /// Assemble the pipeline on top of `backend`. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(config: &Config, backend: Arc<dyn SandboxBackend>) -> Result<Self, RegistryError> {
        let registry = Arc::new(RuntimeRegistry::from_config(config)?);
        let pool = WorkerPool::new(backend, &config.pool, registry.ids().cloned());
        let quota = QuotaManager::new(config.quota.clone());
        let aggregator = ResultAggregator::new(
            config.gateway.delivery_timeout(),
            config.gateway.abandon_after(),
        );
        let scheduler = Scheduler::new(
            Pipeline {
                registry: Arc::clone(&registry),
                pool: pool.clone(),
                limiter: ResourceLimiter::new(config.pool.kill_grace()),
                quota: quota.clone(),
                aggregator: aggregator.clone(),
                output_cap: config.gateway.max_output_bytes,
            },
            config.pool.queue_capacity,
        );

        Ok(Self {
            inner: Arc::new(GatewayInner {
                config: config.gateway.clone(),
                registry,
                pool,
                quota,
                aggregator,
                scheduler,
                stop: CancellationToken::new(),
            }),
        })
    }

    /// Warm the pool and start the dispatcher and the maintenance loop
    pub fn start(&self) -> JoinHandle<()> {
        self.inner.pool.prewarm();
        self.spawn_maintenance(MAINTENANCE_INTERVAL);
        self.inner.scheduler.start()
    }

    /// Periodically release stale results, cancel abandoned requests and
    /// prune idle sessions
    pub fn spawn_maintenance(&self, every: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = inner.stop.cancelled() => break,
                }
                let swept = inner.aggregator.sweep();
                let pruned = inner.quota.prune();
                if swept.expired + swept.abandoned + pruned > 0 {
                    debug!(
                        expired = swept.expired,
                        abandoned = swept.abandoned,
                        pruned_sessions = pruned,
                        "maintenance pass"
                    );
                }
            }
        })
    }

    /// Accept a snippet for execution
    #[instrument(skip(self, source, stdin), fields(source_len = source.len()))]
    pub fn submit(
        &self,
        session: SessionId,
        language: &str,
        source: String,
        stdin: Option<String>,
    ) -> Result<Submission, GatewayError> {
        let inner = &self.inner;
        let language = inner
            .registry
            .resolve(language)
            .map_err(|_| GatewayError::InvalidLanguage(language.to_owned()))?;

        check_size("source", source.len(), inner.config.max_source_bytes)?;
        if let Some(ref stdin) = stdin {
            check_size("stdin", stdin.len(), inner.config.max_stdin_bytes)?;
        }

        // A full queue turns the request away before it costs a token
        inner.scheduler.check_capacity()?;
        let admission = match inner.quota.admit(&session) {
            Admission::Allowed(guard) => guard,
            Admission::Throttled { retry_after } => {
                return Err(GatewayError::Throttled { retry_after });
            }
            Admission::Rejected { retry_after } => {
                return Err(GatewayError::Rejected { retry_after });
            }
        };

        let request = ExecutionRequest {
            id: RequestId::new(),
            language,
            source_code: source,
            stdin,
            client_session_id: session,
            submitted_at: SystemTime::now(),
        };
        let id = request.id;
        let cancel = CancellationToken::new();
        inner.aggregator.register(id, cancel.clone());

        let job = QueuedJob {
            deadline: end_to_end_deadline(request.submitted_at, inner.config.end_to_end_timeout()),
            request,
            cancel,
            admission,
        };
        match inner.scheduler.enqueue(job) {
            Ok(queue_position) => {
                info!(request = %id, queue_position, "accepted");
                Ok(Submission {
                    request_id: id,
                    queue_position,
                })
            }
            Err(e) => {
                inner.aggregator.discard(&id);
                Err(e.into())
            }
        }
    }

    pub fn poll(&self, id: &RequestId, cursor: u64) -> Result<PollSnapshot, GatewayError> {
        self.inner
            .aggregator
            .poll(id, cursor)
            .ok_or(GatewayError::NotFound(*id))
    }

    pub fn subscribe(&self, id: &RequestId, from: u64) -> Result<Subscription, GatewayError> {
        self.inner
            .aggregator
            .subscribe(id, from)
            .ok_or(GatewayError::NotFound(*id))
    }

    pub fn cancel(&self, id: &RequestId) -> Result<(), GatewayError> {
        let inner = &self.inner;
        if !inner.aggregator.contains(id) {
            return Err(GatewayError::NotFound(*id));
        }
        if !inner.scheduler.cancel(id) {
            inner.aggregator.cancel(id);
        }
        Ok(())
    }

    pub fn queue_position(&self, id: &RequestId) -> Option<usize> {
        self.inner.scheduler.queue_position(id)
    }

    /// Upper bound on a submission body before it is parsed
    pub fn request_body_limit(&self) -> usize {
        self.inner.config.request_body_limit()
    }

    pub fn languages(&self) -> Vec<LanguageSummary> {
        self.inner.registry.summaries()
    }

    pub fn quota(&self, session: &SessionId) -> SessionQuota {
        self.inner.quota.snapshot(session)
    }

    pub fn stats(&self) -> ServiceStats {
        let inner = &self.inner;
        ServiceStats {
            pool: inner.pool.stats(),
            scheduler: inner.scheduler.stats(),
            tracked_requests: inner.aggregator.len(),
            tracked_sessions: inner.quota.tracked_sessions(),
        }
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.inner.stop.cancel();
        self.inner.scheduler.shutdown(grace).await;
    }
}

fn check_size(field: &'static str, size: usize, limit: usize) -> Result<(), GatewayError> {
    if size > limit {
        return Err(GatewayError::PayloadTooLarge { field, size, limit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionEvent, Outcome};
    use crate::testing::{Script, ScriptedBackend};

    fn config() -> Config {
        let mut config = Config::default();
        config.gateway.max_source_bytes = 64;
        config.gateway.max_stdin_bytes = 16;
        config.pool.max_workers = 2;
        config.pool.target_ready = 1;
        config.pool.queue_capacity = 4;
        config.quota.burst = 3;
        config.quota.refill_interval_ms = 60_000;
        config
    }

    fn gateway(backend: &ScriptedBackend) -> ExecutionGateway {
        ExecutionGateway::new(&config(), Arc::new(backend.clone())).unwrap()
    }

    fn session() -> SessionId {
        SessionId::new("learner")
    }

    #[tokio::test]
    async fn submit_runs_snippet_end_to_end() {
        let backend = ScriptedBackend::new(|inv| {
            assert_eq!(inv.source(), "print(1+1)");
            Script::stdout("2\n")
        });
        let gateway = gateway(&backend);
        let _dispatcher = gateway.start();

        let submission = gateway
            .submit(session(), "Python", "print(1+1)".to_owned(), None)
            .unwrap();
        let mut events = gateway.subscribe(&submission.request_id, 0).unwrap();

        let mut kinds = Vec::new();
        let mut result = None;
        while let Some(event) = events.next().await {
            kinds.push(event.event.kind());
            if let ExecutionEvent::Finished(r) = event.event {
                result = Some(r);
            }
        }
        let result = result.unwrap();
        assert_eq!(result.outcome, Outcome::Completed);
        assert_eq!(result.stdout, "2\n");
        assert_eq!(kinds, ["queued", "started", "stdout", "result"]);

        // Delivered results are released
        assert!(matches!(
            gateway.poll(&submission.request_id, 0),
            Err(GatewayError::NotFound(_))
        ));
        gateway.shutdown(Duration::from_secs(1)).await;
    }

    #[test]
    fn unknown_language_is_rejected() {
        let gateway = gateway(&ScriptedBackend::new(|_| Script::stdout("")));
        assert!(matches!(
            gateway.submit(session(), "cobol", "DISPLAY 'HI'".to_owned(), None),
            Err(GatewayError::InvalidLanguage(name)) if name == "cobol"
        ));
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let gateway = gateway(&ScriptedBackend::new(|_| Script::stdout("")));
        assert!(matches!(
            gateway.submit(session(), "python", "x".repeat(65), None),
            Err(GatewayError::PayloadTooLarge { field: "source", limit: 64, .. })
        ));
        assert!(matches!(
            gateway.submit(session(), "python", "x".to_owned(), Some("y".repeat(17))),
            Err(GatewayError::PayloadTooLarge { field: "stdin", .. })
        ));
        // Rejected payloads cost no tokens
        assert_eq!(gateway.quota(&session()).tokens_remaining, 3);
    }

    #[tokio::test]
    async fn quota_throttles_bursts() {
        let mut config = config();
        config.quota.max_concurrent_per_session = 10;
        let gateway =
            ExecutionGateway::new(&config, Arc::new(ScriptedBackend::new(|_| Script::stdout(""))))
                .unwrap();

        for _ in 0..3 {
            gateway
                .submit(session(), "python", "pass".to_owned(), None)
                .unwrap();
        }
        match gateway.submit(session(), "python", "pass".to_owned(), None) {
            Err(GatewayError::Throttled { retry_after }) => {
                assert!(retry_after > Duration::from_secs(1));
            }
            other => panic!("expected throttling, got {other:?}"),
        }
        // Other sessions are unaffected
        assert!(
            gateway
                .submit(SessionId::new("other"), "python", "pass".to_owned(), None)
                .is_ok()
        );
    }

    #[tokio::test]
    async fn full_queue_is_service_busy_and_rolled_back() {
        let mut config = config();
        config.quota.burst = 100;
        config.quota.max_concurrent_per_session = 100;
        let gateway =
            ExecutionGateway::new(&config, Arc::new(ScriptedBackend::new(|_| Script::stdout(""))))
                .unwrap();

        // Dispatcher not started, so the queue only fills up
        for i in 0..4 {
            let submission = gateway
                .submit(session(), "python", "pass".to_owned(), None)
                .unwrap();
            assert_eq!(submission.queue_position, i);
        }
        assert!(matches!(
            gateway.submit(session(), "python", "pass".to_owned(), None),
            Err(GatewayError::ServiceBusy)
        ));
        assert_eq!(gateway.stats().tracked_requests, 4);
        assert_eq!(gateway.quota(&session()).concurrent_count, 4);
        assert_eq!(gateway.quota(&session()).tokens_remaining, 96);
    }

    #[tokio::test]
    async fn busy_rejection_does_not_spend_tokens() {
        let mut config = config();
        config.pool.queue_capacity = 1;
        config.quota.burst = 2;
        config.quota.max_concurrent_per_session = 10;
        let gateway =
            ExecutionGateway::new(&config, Arc::new(ScriptedBackend::new(|_| Script::stdout(""))))
                .unwrap();

        let first = gateway
            .submit(session(), "python", "pass".to_owned(), None)
            .unwrap();
        assert!(matches!(
            gateway.submit(session(), "python", "pass".to_owned(), None),
            Err(GatewayError::ServiceBusy)
        ));
        assert_eq!(gateway.quota(&session()).tokens_remaining, 1);

        gateway.cancel(&first.request_id).unwrap();
        let second = gateway.submit(session(), "python", "pass".to_owned(), None);
        assert!(second.is_ok(), "expected admission, got {second:?}");
    }

    #[tokio::test]
    async fn cancel_unknown_request_is_not_found() {
        let gateway = gateway(&ScriptedBackend::new(|_| Script::stdout("")));
        let id = RequestId::new();
        assert!(matches!(gateway.cancel(&id), Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_queued_request() {
        let gateway = gateway(&ScriptedBackend::new(|_| Script::stdout("")));
        let submission = gateway
            .submit(session(), "python", "pass".to_owned(), None)
            .unwrap();
        gateway.cancel(&submission.request_id).unwrap();

        let snapshot = gateway.poll(&submission.request_id, 0).unwrap();
        assert_eq!(
            snapshot.result.map(|r| r.outcome),
            Some(Outcome::Cancelled)
        );
        assert_eq!(gateway.queue_position(&submission.request_id), None);
    }

    #[tokio::test]
    async fn runtime_errors_are_reported() {
        let backend = ScriptedBackend::new(|_| {
            Script::exit(1).with_stderr("Traceback (most recent call last):\nZeroDivisionError\n")
        });
        let gateway = gateway(&backend);
        let _dispatcher = gateway.start();

        let submission = gateway
            .submit(session(), "py", "1/0".to_owned(), None)
            .unwrap();
        let mut events = gateway.subscribe(&submission.request_id, 0).unwrap();
        let mut result = None;
        while let Some(event) = events.next().await {
            if let ExecutionEvent::Finished(r) = event.event {
                result = Some(r);
            }
        }
        let result = result.unwrap();
        assert_eq!(result.outcome, Outcome::RuntimeError);
        assert!(result.stderr.contains("ZeroDivisionError"));
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn start_prewarms_pool() {
        let backend = ScriptedBackend::new(|_| Script::stdout(""));
        let gateway = gateway(&backend);
        let _dispatcher = gateway.start();

        for _ in 0..100 {
            if gateway.stats().pool.ready == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // max_workers caps the warm-up even though four languages want one each
        assert_eq!(gateway.stats().pool.ready, 2);
        assert_eq!(backend.live(), 2);
        gateway.shutdown(Duration::from_secs(1)).await;
        assert_eq!(backend.live(), 0);
    }
}
