//! Isolation worker
//!
//! One worker owns one sandbox for its whole life and runs at most one
//! request in it. [`IsolationWorker::execute`] consumes the worker, and the
//! sandbox is destroyed before it returns whatever the outcome.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, instrument, warn};

use crate::execution::{ExecutionRequest, ExecutionResult, OutputChunk, Outcome, RequestId};
use crate::limiter::{ResourceLimiter, Termination};
use crate::pool::Capacity;
use crate::registry::{LanguageId, RuntimeProfile};
use crate::sandbox::{LaunchPlan, SandboxBackend, SandboxError, Substrate};

mod compile;
mod output;

const STDIN_FILE: &str = "stdin.txt";

/// Unique id of a worker for the life of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Cold,
    Warming,
    Ready,
    Executing,
    Draining,
    Destroyed,
}

impl WorkerState {
    /// Legal lifecycle moves. Any live state may be torn down early.
    pub fn can_become(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Cold, Warming)
                | (Warming, Ready)
                | (Ready, Executing)
                | (Cold | Warming | Ready | Executing, Draining)
                | (Draining, Destroyed)
                | (Cold, Destroyed)
        )
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {worker} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        worker: WorkerId,
        from: WorkerState,
        to: WorkerState,
    },

    #[error("worker {worker} failed to start its sandbox: {source}")]
    Warmup {
        worker: WorkerId,
        #[source]
        source: SandboxError,
    },
}

/// Per-run plumbing handed over by the scheduler
#[derive(Debug)]
pub struct ExecutionContext {
    /// Ordered output chunks while the program runs
    pub output: mpsc::Sender<OutputChunk>,
    pub cancel: CancellationToken,
    /// End-to-end deadline of the request; the run is cut short at this point
    pub deadline: Instant,
    /// stdout + stderr bytes kept
    pub output_cap: usize,
}

/// A single-use execution environment
pub struct IsolationWorker {
    id: WorkerId,
    language: LanguageId,
    state: WorkerState,
    assigned: Option<RequestId>,
    substrate: Option<Box<dyn Substrate>>,
    capacity: Capacity,
}

impl fmt::Debug for IsolationWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationWorker")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("state", &self.state)
            .field("assigned", &self.assigned)
            .field("slot", &self.capacity.slot())
            .finish()
    }
}

impl IsolationWorker {
    pub fn new(language: LanguageId, capacity: Capacity) -> Self {
        Self {
            id: WorkerId::next(),
            language,
            state: WorkerState::Cold,
            assigned: None,
            substrate: None,
            capacity,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn language(&self) -> &LanguageId {
        &self.language
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn assigned_request(&self) -> Option<RequestId> {
        self.assigned
    }

    fn transition(&mut self, next: WorkerState) -> Result<(), WorkerError> {
        if !self.state.can_become(next) {
            return Err(WorkerError::InvalidTransition {
                worker: self.id,
                from: self.state,
                to: next,
            });
        }
        debug!(worker = %self.id, from = ?self.state, to = ?next, "worker transition");
        self.state = next;
        Ok(())
    }

    /// Cold → Warming → Ready: create the sandbox
    #[instrument(skip(self, backend), fields(worker = %self.id, language = %self.language))]
    pub async fn warm(&mut self, backend: &dyn SandboxBackend) -> Result<(), WorkerError> {
        self.transition(WorkerState::Warming)?;
        match backend.create(self.capacity.slot()).await {
            Ok(substrate) => {
                self.substrate = Some(substrate);
                self.transition(WorkerState::Ready)
            }
            Err(source) => {
                self.state = WorkerState::Destroyed;
                Err(WorkerError::Warmup {
                    worker: self.id,
                    source,
                })
            }
        }
    }

    /// Run one request and destroy the sandbox.
    ///
    /// Never fails: infrastructure faults become an `InternalError` result.
    pub async fn execute(
        mut self,
        request: &ExecutionRequest,
        profile: &RuntimeProfile,
        limiter: &ResourceLimiter,
        ctx: ExecutionContext,
    ) -> ExecutionResult {
        let span = info_span!("execute", worker = %self.id, request = %request.id, language = %profile.language_id);
        async move {
            let started = Instant::now();
            let result = match self.begin(request.id) {
                Ok(substrate) => run(substrate, request, profile, limiter, &ctx).await,
                Err(e) => Err(RunFailure::Worker(e)),
            };
            let elapsed = started.elapsed();

            let result = match result {
                Ok(mut result) => {
                    result.duration = elapsed;
                    result
                }
                Err(failure) => {
                    error!(error = %failure, "execution failed inside the sandbox layer");
                    ExecutionResult::empty(request.id, Outcome::InternalError, elapsed)
                }
            };
            self.retire().await;
            result
        }
        .instrument(span)
        .await
    }

    fn begin(&mut self, request: RequestId) -> Result<&mut dyn Substrate, WorkerError> {
        self.transition(WorkerState::Executing)?;
        self.assigned = Some(request);
        match self.substrate.as_deref_mut() {
            Some(substrate) => Ok(substrate),
            None => Err(WorkerError::InvalidTransition {
                worker: self.id,
                from: WorkerState::Executing,
                to: WorkerState::Executing,
            }),
        }
    }

    /// Draining → Destroyed, tearing the sandbox down unconditionally
    pub async fn retire(mut self) {
        if self.state != WorkerState::Destroyed {
            self.state = WorkerState::Draining;
        }
        if let Some(substrate) = self.substrate.take() {
            let id = substrate.id();
            if let Err(e) = substrate.destroy().await {
                error!(worker = %self.id, sandbox = id, error = %e, "failed to destroy sandbox");
            }
        }
        self.state = WorkerState::Destroyed;
        debug!(worker = %self.id, "worker destroyed");
    }
}

#[derive(Debug, Error)]
enum RunFailure {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

async fn run(
    substrate: &mut dyn Substrate,
    request: &ExecutionRequest,
    profile: &RuntimeProfile,
    limiter: &ResourceLimiter,
    ctx: &ExecutionContext,
) -> Result<ExecutionResult, RunFailure> {
    let language = &profile.language;
    substrate
        .stage(&language.source_name(), request.source_code.as_bytes())
        .await?;

    let env = sandbox_env(&language.run.env, &language.run.path);

    if let Some(compile_limits) = profile.compile_limits.as_ref()
        && let Some(failed) =
            compile::compile(substrate, request.id, profile, compile_limits, limiter, ctx).await?
    {
        return Ok(failed);
    }

    let mut plan = LaunchPlan::new(language.run_command(), limiter.run_limits(profile))
        .env(env)
        .mounts(profile.mounts.iter().cloned());
    if let Some(ref stdin) = request.stdin {
        substrate.stage(STDIN_FILE, stdin.as_bytes()).await?;
        plan = plan.stdin_file(STDIN_FILE);
    }

    let watchdog = limiter
        .watchdog(&plan.limits)
        .unwrap_or(profile.wall_clock_limit + limiter.kill_grace());
    let deadline = (Instant::now() + watchdog).min(ctx.deadline);
    let memory_limit_kb = plan.limits.memory_limit;

    let mut process = substrate.launch(plan).await?;

    let stop = ctx.cancel.child_token();
    let pump = tokio::spawn(
        output::pump(
            process.take_stdout(),
            process.take_stderr(),
            ctx.output_cap,
            ctx.output.clone(),
            stop.clone(),
        )
        .in_current_span(),
    );

    let mut supervision = limiter.supervise(process.as_mut(), deadline, &ctx.cancel).await;
    let captured = drain(pump, stop, limiter.kill_grace()).await;

    // A run cut short by the end-to-end deadline is a timeout, not a cancellation
    if supervision.termination == Termination::Cancelled && Instant::now() >= ctx.deadline {
        supervision.termination = Termination::WallClock;
    }
    if memory_limit_kb.is_some()
        && let Ok(ref mut report) = supervision.report
    {
        report.detect_allocation_failure(&captured.stderr);
    }
    let outcome = limiter.classify(&mut supervision, memory_limit_kb);
    if outcome == Outcome::InternalError
        && let Err(ref e) = supervision.report
    {
        error!(error = %e, "sandbox did not report on the run");
    }

    Ok(ExecutionResult {
        request_id: request.id,
        stdout: captured.stdout,
        stderr: captured.stderr,
        exit_code: supervision.report.as_ref().ok().and_then(|r| r.exit_code),
        truncated: captured.truncated,
        outcome,
        duration: supervision.elapsed,
    })
}

/// Wait briefly for the relay to hit EOF, then stop it
async fn drain(
    mut pump: tokio::task::JoinHandle<output::Captured>,
    stop: CancellationToken,
    grace: Duration,
) -> output::Captured {
    if let Ok(joined) = tokio::time::timeout(grace, &mut pump).await {
        return joined.unwrap_or_else(|e| {
            warn!(error = %e, "output relay task failed");
            output::Captured::default()
        });
    }
    stop.cancel();
    pump.await.unwrap_or_else(|e| {
        warn!(error = %e, "output relay task failed");
        output::Captured::default()
    })
}

pub(crate) fn sandbox_env(env: &HashMap<String, String>, path: &str) -> BTreeMap<String, String> {
    let mut vars: BTreeMap<_, _> = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.entry("PATH".to_owned()).or_insert_with(|| path.to_owned());
    vars
}
