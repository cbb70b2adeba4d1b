//! Build step for compiled runtimes
//!
//! Runs the language's compile command in the same sandbox the program will
//! later run in. Compiler diagnostics are not streamed live; on failure they
//! are relayed as a single stderr chunk and end the request.

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, instrument};

use super::{ExecutionContext, drain, output, sandbox_env};
use crate::execution::{ExecutionResult, OutputChunk, OutputStream, Outcome, RequestId};
use crate::limiter::{ResourceLimiter, Termination};
use crate::registry::RuntimeProfile;
use crate::sandbox::{LaunchPlan, SandboxError, Substrate};
use crate::types::ResourceLimits;

/// Compile the staged source. `Ok(None)` means the binary is ready to run;
/// `Ok(Some(result))` is the final result of a failed build.
#[instrument(skip_all, fields(language = %profile.language_id))]
pub(super) async fn compile(
    substrate: &mut dyn Substrate,
    request: RequestId,
    profile: &RuntimeProfile,
    limits: &ResourceLimits,
    limiter: &ResourceLimiter,
    ctx: &ExecutionContext,
) -> Result<Option<ExecutionResult>, SandboxError> {
    let language = &profile.language;
    let (Some(compile), Some(command)) = (language.compile.as_ref(), language.compile_command())
    else {
        return Ok(None);
    };

    let mut limits = limits.clone();
    if limits.wall_time_limit.is_none() {
        limits.wall_time_limit = Some(profile.wall_clock_limit.as_secs_f64());
    }
    let watchdog = limiter
        .watchdog(&limits)
        .unwrap_or(profile.wall_clock_limit + limiter.kill_grace());
    let deadline = (Instant::now() + watchdog).min(ctx.deadline);
    let memory_limit_kb = limits.memory_limit;

    let plan = LaunchPlan::new(command, limits)
        .env(sandbox_env(&compile.env, &language.run.path))
        .mounts(profile.mounts.iter().cloned());
    let mut process = substrate.launch(plan).await?;

    // Diagnostics are collected, not streamed
    let (tx, _) = mpsc::channel(1);
    let stop = ctx.cancel.child_token();
    let pump = tokio::spawn(output::pump(
        process.take_stdout(),
        process.take_stderr(),
        ctx.output_cap,
        tx,
        stop.clone(),
    ));

    let mut supervision = limiter.supervise(process.as_mut(), deadline, &ctx.cancel).await;
    let captured = drain(pump, stop, limiter.kill_grace()).await;
    if supervision.termination == Termination::Cancelled && Instant::now() >= ctx.deadline {
        supervision.termination = Termination::WallClock;
    }
    let outcome = limiter.classify(&mut supervision, memory_limit_kb);
    let exit_code = supervision.report.as_ref().ok().and_then(|r| r.exit_code);

    debug!(?outcome, ?exit_code, "compilation finished");
    if outcome == Outcome::Completed {
        return Ok(None);
    }

    let mut diagnostics = captured.stdout;
    diagnostics.push_str(&captured.stderr);
    if diagnostics.is_empty()
        && let Ok(ref report) = supervision.report
        && let Some(ref message) = report.message
    {
        diagnostics = message.clone();
    }
    if !diagnostics.is_empty() {
        let _ = ctx
            .output
            .send(OutputChunk {
                stream: OutputStream::Stderr,
                data: diagnostics.clone(),
            })
            .await;
    }

    Ok(Some(ExecutionResult {
        request_id: request,
        stdout: String::new(),
        stderr: diagnostics,
        exit_code,
        truncated: captured.truncated,
        outcome,
        duration: supervision.elapsed,
    }))
}
