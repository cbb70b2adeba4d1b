//! Substrate abstraction
//!
//! An isolation worker drives one sandbox through these traits: create it,
//! stage files, launch a process with streamed output, wait, destroy. The
//! isolate backend is the production implementation.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::isolate::IsolateError;
use crate::types::{MountConfig, ResourceLimits, SandboxReport};

/// Readable end of a sandboxed program's stdout or stderr
pub type OutputReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Isolate(#[from] IsolateError),

    #[error("sandbox {id} is unusable: {message}")]
    Unusable { id: u32, message: String },

    #[error("process did not exit after being killed")]
    KillTimedOut,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to start one process inside a staged sandbox
#[derive(Debug, Clone, Default)]
pub struct LaunchPlan {
    /// Program and arguments, program first
    pub command: Vec<String>,
    pub limits: ResourceLimits,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<MountConfig>,
    /// Staged file fed to the program's stdin, if any
    pub stdin_file: Option<String>,
}

impl LaunchPlan {
    pub fn new(command: Vec<String>, limits: ResourceLimits) -> Self {
        Self {
            command,
            limits,
            ..Self::default()
        }
    }

    pub fn env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn mounts(mut self, mounts: impl IntoIterator<Item = MountConfig>) -> Self {
        self.mounts.extend(mounts);
        self
    }

    pub fn stdin_file(mut self, name: impl Into<String>) -> Self {
        self.stdin_file = Some(name.into());
        self
    }
}

/// Creates fresh sandboxes. Slot ids are unique among live sandboxes.
#[async_trait]
pub trait SandboxBackend: Send + Sync + fmt::Debug {
    async fn create(&self, slot: u32) -> Result<Box<dyn Substrate>, SandboxError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// One live sandbox
#[async_trait]
pub trait Substrate: Send + Sync + fmt::Debug {
    fn id(&self) -> u32;

    /// Write a file into the sandbox working directory
    async fn stage(&mut self, name: &str, contents: &[u8]) -> Result<(), SandboxError>;

    async fn launch(&mut self, plan: LaunchPlan) -> Result<Box<dyn RunningProcess>, SandboxError>;

    /// Tear the sandbox down. Must be called exactly once.
    async fn destroy(self: Box<Self>) -> Result<(), SandboxError>;
}

/// A process started by [`Substrate::launch`]
#[async_trait]
pub trait RunningProcess: Send {
    fn take_stdout(&mut self) -> Option<OutputReader>;

    fn take_stderr(&mut self) -> Option<OutputReader>;

    /// Wait for exit and return the sandbox's accounting for the run
    async fn wait(&mut self) -> Result<SandboxReport, SandboxError>;

    /// Forcefully stop the process. Subsequent `wait` calls return promptly.
    async fn kill(&mut self) -> Result<(), SandboxError>;
}
