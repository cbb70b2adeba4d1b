//! IOI Isolate substrate
//!
//! Builds isolate command lines, manages box lifecycle and parses meta files.
//!
//! References for isolate's CLI and meta files:
//! - https://www.ucw.cz/isolate/isolate.1.html
//! - https://github.com/ioi/isolate

use std::fs;
use std::path::Path;

use thiserror::Error;

pub use crate::isolate::box_manager::{IsolateBackend, IsolateBox};
pub use crate::isolate::command::{IsolateAction, IsolateCommand};
pub use crate::isolate::meta::{MetaFile, MetaParseError};
pub use crate::isolate::process::IsolateProcess;
use crate::types::MountConfig;

mod box_manager;
mod command;
mod meta;
mod process;

#[derive(Debug, Error)]
pub enum IsolateError {
    #[error("failed to initialize box {id}: {message}")]
    InitFailed { id: u32, message: String },

    #[error("failed to cleanup box {id}: {message}")]
    CleanupFailed { id: u32, message: String },

    #[error("isolate command failed: {0}")]
    CommandFailed(String),

    #[error("failed to spawn isolate process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("failed to parse meta file: {0}")]
    MetaParseFailed(String),

    #[error("box {0} not found or not initialized")]
    BoxNotFound(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("mount source path does not exist: {0}")]
    MountSourceNotFound(String),
}

/// Set up the cgroup v2 hierarchy isolate expects at `cg_root`.
///
/// Outside systemd hosts `isolate-cg-keeper` is not running, so the service
/// creates the cgroup itself and enables the memory and pids controllers.
///
/// Returns `Ok(false)` when cgroup v2 or its memory controller is not
/// available and the caller should fall back to RLIMIT_AS.
pub fn prepare_cgroup(cg_root: &Path) -> Result<bool, IsolateError> {
    let cg_base = Path::new("/sys/fs/cgroup");

    let controllers_path = cg_base.join("cgroup.controllers");
    if !controllers_path.exists() {
        return Ok(false);
    }
    let controllers = fs::read_to_string(&controllers_path)?;
    if !controllers.split_whitespace().any(|c| c == "memory") {
        return Ok(false);
    }

    if let Ok(content) = fs::read_to_string(cg_root.join("cgroup.subtree_control"))
        && content.split_whitespace().any(|c| c == "memory")
    {
        return Ok(true);
    }

    // cgroup v2 forbids enabling controllers on a cgroup that holds
    // processes, so move ourselves into a leaf first
    let init_cg = cg_base.join("init");
    if !init_cg.exists() {
        fs::create_dir(&init_cg)?;
    }
    fs::write(init_cg.join("cgroup.procs"), std::process::id().to_string())?;
    fs::write(cg_base.join("cgroup.subtree_control"), "+memory +pids")?;

    if !cg_root.exists() {
        fs::create_dir(cg_root)?;
    }
    fs::write(cg_root.join("cgroup.subtree_control"), "+memory +pids")?;

    Ok(true)
}

/// Check that every required mount source exists on the host
pub fn validate_mounts<'a>(
    mounts: impl IntoIterator<Item = &'a MountConfig>,
) -> Result<(), IsolateError> {
    for mount in mounts {
        if !mount.optional && !Path::new(&mount.source).exists() {
            return Err(IsolateError::MountSourceNotFound(mount.source.clone()));
        }
    }
    Ok(())
}

/// Resolve a bare program name to an absolute path using the host's PATH.
///
/// Isolate calls `execve` directly, which does not search PATH. Commands
/// already containing a `/` are left unchanged. Symlinks are resolved so the
/// target is reachable across bind mounts.
pub fn resolve_command(command: &mut [String]) -> Result<(), IsolateError> {
    let Some(first) = command.first_mut() else {
        return Ok(());
    };
    if first.contains('/') {
        return Ok(());
    }

    let path_var = std::env::var("PATH").unwrap_or_default();
    let found = path_var
        .split(':')
        .map(|dir| Path::new(dir).join(&*first))
        .find(|candidate| candidate.exists());

    match found {
        Some(candidate) => {
            *first = fs::canonicalize(&candidate)
                .unwrap_or(candidate)
                .to_string_lossy()
                .into_owned();
            Ok(())
        }
        None => Err(IsolateError::CommandFailed(format!(
            "command '{first}' not found in PATH"
        ))),
    }
}
