//! A program running under `isolate --run`

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::isolate::IsolateError;
use crate::isolate::meta::MetaFile;
use crate::sandbox::{OutputReader, RunningProcess, SandboxError};
use crate::types::{ExecutionStatus, SandboxReport};

/// Handle to a spawned isolate process with piped stdout and stderr
#[derive(Debug)]
pub struct IsolateProcess {
    child: Child,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    meta_path: PathBuf,
    killed: bool,
}

impl IsolateProcess {
    /// Spawn isolate with the given argument vector (program first)
    pub fn spawn(args: Vec<String>, meta_path: PathBuf) -> Result<Self, IsolateError> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| IsolateError::CommandFailed("empty command arguments".to_owned()))?;
        debug!(?args, "spawning isolate process");

        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(IsolateError::SpawnFailed)?;

        Ok(Self {
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            meta_path,
            killed: false,
        })
    }
}

#[async_trait]
impl RunningProcess for IsolateProcess {
    fn take_stdout(&mut self) -> Option<OutputReader> {
        self.stdout.take().map(|s| Box::pin(s) as OutputReader)
    }

    fn take_stderr(&mut self) -> Option<OutputReader> {
        self.stderr.take().map(|s| Box::pin(s) as OutputReader)
    }

    async fn wait(&mut self) -> Result<SandboxReport, SandboxError> {
        let status = self.child.wait().await?;

        if tokio::fs::try_exists(&self.meta_path).await? {
            return Ok(MetaFile::load(&self.meta_path).await?.to_report());
        }
        if self.killed {
            // Isolate was stopped before it could write its accounting
            return Ok(SandboxReport {
                status: ExecutionStatus::Signaled,
                signal: Some(9),
                killed: true,
                ..SandboxReport::default()
            });
        }

        warn!(?status, "isolate exited without a meta file");
        Err(IsolateError::CommandFailed(format!("isolate exited with {status} and no meta file")).into())
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        self.killed = true;
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already exited
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
