//! Isolate box lifecycle
//!
//! [`IsolateBackend`] creates boxes with `isolate --init`; each [`IsolateBox`]
//! is one [`Substrate`] that the worker stages files into, launches programs
//! in, and finally destroys with `isolate --cleanup`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::isolate::command::{IsolateAction, IsolateCommand};
use crate::isolate::process::IsolateProcess;
use crate::isolate::{IsolateError, resolve_command};
use crate::sandbox::{LaunchPlan, RunningProcess, SandboxBackend, SandboxError, Substrate};
use crate::types::MountConfig;

const META_FILE: &str = "meta.txt";

/// Creates isolate boxes
#[derive(Debug, Clone)]
pub struct IsolateBackend {
    isolate_path: PathBuf,
    cgroup: bool,
    /// Mounted into every box in addition to the language's own mounts
    mounts: Vec<MountConfig>,
}

impl IsolateBackend {
    pub fn new(isolate_path: impl Into<PathBuf>, cgroup: bool) -> Self {
        Self {
            isolate_path: isolate_path.into(),
            cgroup,
            mounts: Vec::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            isolate_path: config.isolate_binary(),
            cgroup: config.cgroup,
            mounts: config.sandbox_mounts.clone(),
        }
    }
}

#[async_trait]
impl SandboxBackend for IsolateBackend {
    async fn create(&self, slot: u32) -> Result<Box<dyn Substrate>, SandboxError> {
        let sandbox = IsolateBox::init(slot, &self.isolate_path, self.cgroup)
            .await?
            .with_mounts(self.mounts.clone());
        Ok(Box::new(sandbox))
    }

    fn name(&self) -> &'static str {
        "isolate"
    }
}

/// An initialized isolate box
///
/// Call [`cleanup()`](Self::cleanup) (or [`Substrate::destroy`]) before
/// dropping. `Drop` only attempts a best-effort cleanup on a spawned thread.
#[derive(Debug)]
pub struct IsolateBox {
    id: u32,
    /// Host directory returned by `isolate --init`; the sandbox sees `box/` as `/box`
    box_path: PathBuf,
    isolate_path: PathBuf,
    initialized: bool,
    cgroup: bool,
    mounts: Vec<MountConfig>,
}

impl IsolateBox {
    #[instrument(skip(isolate_path))]
    pub async fn init(
        id: u32,
        isolate_path: impl Into<PathBuf>,
        cgroup: bool,
    ) -> Result<Self, IsolateError> {
        let isolate_path = isolate_path.into();
        let args = IsolateCommand::new(&isolate_path, id)
            .action(IsolateAction::Init)
            .cgroup(cgroup)
            .build();

        let output = run_control(&args).await?;
        if !output.status.success() {
            return Err(IsolateError::InitFailed {
                id,
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let box_path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        if !box_path.exists() {
            return Err(IsolateError::InitFailed {
                id,
                message: format!("box path does not exist: {}", box_path.display()),
            });
        }

        debug!(?box_path, "box initialized");
        Ok(Self {
            id,
            box_path,
            isolate_path,
            initialized: true,
            cgroup,
            mounts: Vec::new(),
        })
    }

    fn with_mounts(mut self, mounts: Vec<MountConfig>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn path(&self) -> &Path {
        &self.box_path
    }

    /// Host path of a file inside the sandbox working directory
    pub fn file_path(&self, name: &str) -> Result<PathBuf, IsolateError> {
        check_relative(name)?;
        Ok(self.box_path.join("box").join(name))
    }

    /// The same file as seen from inside the sandbox
    pub fn sandbox_path(&self, name: &str) -> Result<PathBuf, IsolateError> {
        check_relative(name)?;
        Ok(PathBuf::from("/box").join(name))
    }

    pub async fn write_file(&self, name: &str, content: &[u8]) -> Result<(), IsolateError> {
        let path = self.file_path(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        debug!(?path, len = content.len(), "staged file");
        Ok(())
    }

    #[must_use = "cleanup errors should be handled"]
    #[instrument(skip(self), fields(box_id = self.id))]
    pub async fn cleanup(&mut self) -> Result<(), IsolateError> {
        if !self.initialized {
            return Ok(());
        }

        let args = IsolateCommand::new(&self.isolate_path, self.id)
            .action(IsolateAction::Cleanup)
            .cgroup(self.cgroup)
            .build();
        let output = run_control(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(stderr = %stderr, "cleanup failed");
            return Err(IsolateError::CleanupFailed {
                id: self.id,
                message: stderr.trim().to_owned(),
            });
        }

        self.initialized = false;
        debug!("box cleaned up");
        Ok(())
    }
}

#[async_trait]
impl Substrate for IsolateBox {
    fn id(&self) -> u32 {
        self.id
    }

    async fn stage(&mut self, name: &str, contents: &[u8]) -> Result<(), SandboxError> {
        Ok(self.write_file(name, contents).await?)
    }

    #[instrument(skip(self, plan), fields(box_id = self.id))]
    async fn launch(&mut self, plan: LaunchPlan) -> Result<Box<dyn RunningProcess>, SandboxError> {
        if !self.initialized {
            return Err(IsolateError::BoxNotFound(self.id).into());
        }

        // Outside `box/`, so the program cannot see or forge it
        let meta_path = self.box_path.join(META_FILE);
        if tokio::fs::try_exists(&meta_path).await? {
            tokio::fs::remove_file(&meta_path).await?;
        }

        let mut program = plan.command;
        resolve_command(&mut program)?;

        let mut command = IsolateCommand::new(&self.isolate_path, self.id)
            .cgroup(self.cgroup)
            .silent(true)
            .limits(plan.limits)
            .mounts(self.mounts.iter().cloned().chain(plan.mounts))
            .meta_file(&meta_path)
            .working_dir("/box")
            .command(program);
        for (key, value) in plan.env {
            command = command.env(key, value);
        }
        if let Some(ref stdin) = plan.stdin_file {
            command = command.stdin(self.sandbox_path(stdin)?);
        }

        let process = IsolateProcess::spawn(command.build(), meta_path)?;
        Ok(Box::new(process))
    }

    async fn destroy(mut self: Box<Self>) -> Result<(), SandboxError> {
        Ok(self.cleanup().await?)
    }
}

impl Drop for IsolateBox {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }
        warn!(
            box_id = self.id,
            box_path = %self.box_path.display(),
            "isolate box dropped without cleanup, attempting best-effort cleanup"
        );

        let args = IsolateCommand::new(&self.isolate_path, self.id)
            .action(IsolateAction::Cleanup)
            .cgroup(self.cgroup)
            .build();
        let id = self.id;
        std::thread::spawn(move || {
            let Some((program, rest)) = args.split_first() else {
                return;
            };
            match std::process::Command::new(program).args(rest).output() {
                Ok(output) if output.status.success() => {
                    debug!(box_id = id, "best-effort cleanup succeeded");
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!(box_id = id, stderr = %stderr, "best-effort cleanup failed");
                }
                Err(e) => warn!(box_id = id, error = %e, "best-effort cleanup spawn failed"),
            }
        });
    }
}

fn check_relative(name: &str) -> Result<(), IsolateError> {
    if name.contains("..") || name.starts_with('/') {
        return Err(IsolateError::InvalidPath(format!(
            "path traversal not allowed: {name}"
        )));
    }
    Ok(())
}

/// Run an `--init` or `--cleanup` invocation to completion
async fn run_control(args: &[String]) -> Result<std::process::Output, IsolateError> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| IsolateError::CommandFailed("empty command arguments".to_owned()))?;
    debug!(?args, "running isolate");
    Command::new(program)
        .args(rest)
        .output()
        .await
        .map_err(IsolateError::SpawnFailed)
}
