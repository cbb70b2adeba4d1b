//! Scripted in-memory substrate
//!
//! Stands in for isolate in tests: every launch is answered by a responder
//! closure that inspects the staged files and returns a [`Script`] describing
//! the output, run time and sandbox report of the "program".

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::sandbox::{
    LaunchPlan, OutputReader, RunningProcess, SandboxBackend, SandboxError, Substrate,
};
use crate::types::{ExecutionStatus, LimitExceeded, ResourceLimits, SandboxReport};

/// Behaviour of one scripted program run
#[derive(Debug, Clone)]
pub struct Script {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub runtime: Duration,
    pub report: SandboxReport,
    /// Files the program leaves behind in its sandbox
    pub writes: Vec<(String, Vec<u8>)>,
}

impl Script {
    fn exited(code: i32) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            runtime: Duration::from_millis(5),
            report: SandboxReport {
                status: if code == 0 {
                    ExecutionStatus::Ok
                } else {
                    ExecutionStatus::RuntimeError
                },
                exit_code: Some(code),
                ..SandboxReport::default()
            },
            writes: Vec::new(),
        }
    }

    /// Prints `text` and exits 0
    pub fn stdout(text: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: text.into(),
            ..Self::exited(0)
        }
    }

    pub fn exit(code: i32) -> Self {
        Self::exited(code)
    }

    /// Never exits on its own
    pub fn hang() -> Self {
        Self {
            runtime: Duration::from_secs(3600),
            ..Self::exited(0)
        }
    }

    /// Killed by the sandbox for exceeding its memory limit
    pub fn out_of_memory() -> Self {
        Self {
            report: SandboxReport {
                status: ExecutionStatus::Signaled,
                limit_exceeded: LimitExceeded::Memory,
                signal: Some(9),
                killed: true,
                message: Some("Out of memory".to_owned()),
                ..SandboxReport::default()
            },
            ..Self::exited(0)
        }
    }

    /// Sandbox infrastructure failure
    pub fn internal_error() -> Self {
        Self {
            report: SandboxReport {
                status: ExecutionStatus::InternalError,
                message: Some("cannot set up box".to_owned()),
                ..SandboxReport::default()
            },
            ..Self::exited(0)
        }
    }

    pub fn with_stderr(mut self, text: impl Into<Vec<u8>>) -> Self {
        self.stderr = text.into();
        self
    }

    pub fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn writing(mut self, name: &str, contents: &[u8]) -> Self {
        self.writes.push((name.to_owned(), contents.to_vec()));
        self
    }
}

/// What the responder gets to look at
#[derive(Debug, Clone)]
pub struct Invocation {
    pub box_id: u32,
    pub command: Vec<String>,
    pub limits: ResourceLimits,
    /// Everything present in the sandbox at launch time
    pub files: BTreeMap<String, Vec<u8>>,
    pub stdin: Option<Vec<u8>>,
}

impl Invocation {
    pub fn file(&self, name: &str) -> Option<&str> {
        self.files
            .get(name)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// The staged file the command refers to
    pub fn source(&self) -> &str {
        self.command
            .iter()
            .rev()
            .find_map(|arg| self.file(arg))
            .unwrap_or_default()
    }

    pub fn stdin_text(&self) -> &str {
        self.stdin
            .as_deref()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .unwrap_or_default()
    }
}

type Responder = dyn Fn(&Invocation) -> Script + Send + Sync;

struct BackendState {
    responder: Box<Responder>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    live: Mutex<HashSet<u32>>,
    fail_create: AtomicBool,
    create_delay: Duration,
    invocations: Mutex<Vec<Invocation>>,
}

/// In-memory [`SandboxBackend`]
#[derive(Clone)]
pub struct ScriptedBackend {
    state: Arc<BackendState>,
}

impl fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("created", &self.created())
            .field("destroyed", &self.destroyed())
            .finish_non_exhaustive()
    }
}

impl ScriptedBackend {
    pub fn new(responder: impl Fn(&Invocation) -> Script + Send + Sync + 'static) -> Self {
        Self::build(Box::new(responder), Duration::ZERO)
    }

    /// Like [`new`](Self::new) but every sandbox creation takes `delay`
    pub fn with_create_delay(
        delay: Duration,
        responder: impl Fn(&Invocation) -> Script + Send + Sync + 'static,
    ) -> Self {
        Self::build(Box::new(responder), delay)
    }

    fn build(responder: Box<Responder>, create_delay: Duration) -> Self {
        Self {
            state: Arc::new(BackendState {
                responder,
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                live: Mutex::new(HashSet::new()),
                fail_create: AtomicBool::new(false),
                create_delay,
                invocations: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Make subsequent `create` calls fail
    pub fn fail_creates(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.state.destroyed.load(Ordering::SeqCst)
    }

    /// Sandboxes created and not yet destroyed
    pub fn live(&self) -> usize {
        self.state.live.lock().map(|live| live.len()).unwrap_or_default()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state
            .invocations
            .lock()
            .map(|list| list.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    async fn create(&self, slot: u32) -> Result<Box<dyn Substrate>, SandboxError> {
        if !self.state.create_delay.is_zero() {
            tokio::time::sleep(self.state.create_delay).await;
        }
        if self.state.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::Unusable {
                id: slot,
                message: "scripted create failure".to_owned(),
            });
        }
        let fresh = self
            .state
            .live
            .lock()
            .map(|mut live| live.insert(slot))
            .unwrap_or(false);
        if !fresh {
            return Err(SandboxError::Unusable {
                id: slot,
                message: "slot already holds a live sandbox".to_owned(),
            });
        }
        self.state.created.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ScriptedSubstrate {
            id: slot,
            files: BTreeMap::new(),
            state: Arc::clone(&self.state),
        }))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct ScriptedSubstrate {
    id: u32,
    files: BTreeMap<String, Vec<u8>>,
    state: Arc<BackendState>,
}

impl fmt::Debug for ScriptedSubstrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedSubstrate")
            .field("id", &self.id)
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl Substrate for ScriptedSubstrate {
    fn id(&self) -> u32 {
        self.id
    }

    async fn stage(&mut self, name: &str, contents: &[u8]) -> Result<(), SandboxError> {
        self.files.insert(name.to_owned(), contents.to_vec());
        Ok(())
    }

    async fn launch(&mut self, plan: LaunchPlan) -> Result<Box<dyn RunningProcess>, SandboxError> {
        let invocation = Invocation {
            box_id: self.id,
            stdin: plan
                .stdin_file
                .as_ref()
                .and_then(|name| self.files.get(name).cloned()),
            command: plan.command,
            limits: plan.limits,
            files: self.files.clone(),
        };
        let script = (self.state.responder)(&invocation);
        if let Ok(mut list) = self.state.invocations.lock() {
            list.push(invocation);
        }

        for (name, contents) in &script.writes {
            self.files.insert(name.clone(), contents.clone());
        }
        Ok(Box::new(ScriptedProcess::new(script)))
    }

    async fn destroy(self: Box<Self>) -> Result<(), SandboxError> {
        if let Ok(mut live) = self.state.live.lock() {
            live.remove(&self.id);
        }
        self.state.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A scripted program run
pub struct ScriptedProcess {
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
    runtime: Duration,
    report: SandboxReport,
    killed: CancellationToken,
}

impl ScriptedProcess {
    pub fn new(script: Script) -> Self {
        Self {
            stdout: Some(script.stdout),
            stderr: Some(script.stderr),
            runtime: script.runtime,
            report: script.report,
            killed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl RunningProcess for ScriptedProcess {
    fn take_stdout(&mut self) -> Option<OutputReader> {
        self.stdout
            .take()
            .map(|bytes| Box::pin(Cursor::new(bytes)) as OutputReader)
    }

    fn take_stderr(&mut self) -> Option<OutputReader> {
        self.stderr
            .take()
            .map(|bytes| Box::pin(Cursor::new(bytes)) as OutputReader)
    }

    async fn wait(&mut self) -> Result<SandboxReport, SandboxError> {
        tokio::select! {
            _ = tokio::time::sleep(self.runtime) => Ok(self.report.clone()),
            _ = self.killed.cancelled() => Ok(SandboxReport {
                status: ExecutionStatus::Signaled,
                signal: Some(9),
                killed: true,
                ..SandboxReport::default()
            }),
        }
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        self.killed.cancel();
        Ok(())
    }
}
