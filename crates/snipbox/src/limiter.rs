//! Resource limiter
//!
//! Turns a runtime profile into the limits passed to the sandbox, watches the
//! running process against a wall clock deadline and cancellation, and maps
//! what happened onto an [`Outcome`].

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::execution::Outcome;
use crate::registry::RuntimeProfile;
use crate::sandbox::{RunningProcess, SandboxError};
use crate::types::{ExecutionStatus, LimitExceeded, ResourceLimits, SandboxReport};

/// Why supervision stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own (possibly killed by the sandbox itself)
    Exited,
    /// The watchdog deadline passed and the process was killed
    WallClock,
    /// The request was cancelled and the process was killed
    Cancelled,
}

#[derive(Debug)]
pub struct Supervision {
    pub termination: Termination,
    pub report: Result<SandboxReport, SandboxError>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    /// Slack past the wall clock limit before the watchdog steps in
    kill_grace: Duration,
}

impl ResourceLimiter {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    pub fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    /// Limits handed to the sandbox for the run step. The wall clock ceiling is
    /// always set so the sandbox enforces it before the watchdog has to.
    pub fn run_limits(&self, profile: &RuntimeProfile) -> ResourceLimits {
        let mut limits = profile.limits.clone();
        if limits.wall_time_limit.is_none() {
            limits.wall_time_limit = Some(profile.wall_clock_limit.as_secs_f64());
        }
        limits
    }

    /// How long the watchdog lets a run go before killing it
    pub fn watchdog(&self, limits: &ResourceLimits) -> Option<Duration> {
        let extra = limits
            .extra_time
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or_default();
        limits.wall_clock().map(|wall| wall + extra + self.kill_grace)
    }

    /// Wait for `process` to exit, killing it when `deadline` passes or
    /// `cancel` fires
    pub async fn supervise(
        &self,
        process: &mut dyn RunningProcess,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Supervision {
        let started = Instant::now();

        let termination = tokio::select! {
            report = process.wait() => {
                return Supervision {
                    termination: Termination::Exited,
                    report,
                    elapsed: started.elapsed(),
                };
            }
            _ = tokio::time::sleep_until(deadline) => Termination::WallClock,
            _ = cancel.cancelled() => Termination::Cancelled,
        };

        debug!(?termination, "killing sandboxed process");
        if let Err(e) = process.kill().await {
            warn!(error = %e, "failed to kill sandboxed process");
        }
        let report = match tokio::time::timeout(self.kill_grace, process.wait()).await {
            Ok(report) => report,
            Err(_) => Err(SandboxError::KillTimedOut),
        };

        Supervision {
            termination,
            report,
            elapsed: started.elapsed(),
        }
    }

    /// Map a finished supervision onto the outcome shown to the caller
    pub fn classify(&self, supervision: &mut Supervision, memory_limit_kb: Option<u64>) -> Outcome {
        match supervision.termination {
            Termination::WallClock => return Outcome::TimedOut,
            Termination::Cancelled => return Outcome::Cancelled,
            Termination::Exited => {}
        }

        let report = match supervision.report {
            Ok(ref mut report) => report,
            Err(_) => return Outcome::InternalError,
        };
        if let Some(limit) = memory_limit_kb {
            report.detect_memory_limit(limit);
        }
        classify_report(report)
    }
}

/// Outcome for a process that exited under the sandbox's own supervision
pub fn classify_report(report: &SandboxReport) -> Outcome {
    match (report.status, report.limit_exceeded) {
        (ExecutionStatus::InternalError, _) => Outcome::InternalError,
        (_, LimitExceeded::Time | LimitExceeded::WallTime) => Outcome::TimedOut,
        (ExecutionStatus::TimeLimitExceeded, _) => Outcome::TimedOut,
        (_, LimitExceeded::Memory | LimitExceeded::Output) => Outcome::ResourceExceeded,
        _ if report.is_success() => Outcome::Completed,
        _ => Outcome::RuntimeError,
    }
}

/// Combined stdout and stderr allowance for one run
#[derive(Debug, Clone)]
pub struct OutputBudget {
    remaining: usize,
    truncated: bool,
}

impl OutputBudget {
    pub fn new(cap: usize) -> Self {
        Self {
            remaining: cap,
            truncated: false,
        }
    }

    /// The prefix of `text` that still fits, cut on a character boundary.
    /// Anything dropped marks the budget truncated.
    pub fn take<'a>(&mut self, text: &'a str) -> &'a str {
        if text.len() <= self.remaining {
            self.remaining -= text.len();
            return text;
        }

        let mut end = self.remaining;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        self.remaining = 0;
        self.truncated = true;
        &text[..end]
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn exhausted(&self) -> bool {
        self.remaining == 0
    }
}
