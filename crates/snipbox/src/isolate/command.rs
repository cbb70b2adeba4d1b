//! Argument builder for the isolate CLI

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::{MountConfig, ResourceLimits};

/// Builder for one isolate invocation
#[derive(Debug)]
pub struct IsolateCommand {
    isolate_path: PathBuf,
    action: IsolateAction,
    /// -b, --box-id
    box_id: u32,
    limits: ResourceLimits,
    mounts: Vec<MountConfig>,
    /// -E, --env; ordered so argument lists are reproducible
    env: BTreeMap<String, String>,
    /// -M, --meta
    meta_file: Option<PathBuf>,
    /// -i, --stdin
    stdin: Option<PathBuf>,
    /// -s, --silent
    silent: bool,
    working_dir: Option<String>,
    command: Vec<String>,
    cgroup: bool,
}

impl IsolateCommand {
    pub fn new(isolate_path: impl Into<PathBuf>, box_id: u32) -> Self {
        Self {
            isolate_path: isolate_path.into(),
            action: IsolateAction::Run,
            box_id,
            limits: ResourceLimits::unset(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            meta_file: None,
            stdin: None,
            silent: false,
            working_dir: None,
            command: Vec::new(),
            cgroup: false,
        }
    }

    pub fn action(mut self, action: IsolateAction) -> Self {
        self.action = action;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn mounts(mut self, mounts: impl IntoIterator<Item = MountConfig>) -> Self {
        self.mounts.extend(mounts);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn meta_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.meta_file = Some(path.into());
        self
    }

    /// Path as seen from inside the sandbox
    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    /// Suppress isolate's own status line so the piped stderr carries only
    /// the program's output
    pub fn silent(mut self, enable: bool) -> Self {
        self.silent = enable;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command(mut self, cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn cgroup(mut self, enable: bool) -> Self {
        self.cgroup = enable;
        self
    }

    /// Build the argument vector, program first
    pub fn build(self) -> Vec<String> {
        let mut args = vec![
            self.isolate_path.to_string_lossy().into_owned(),
            format!("--box-id={}", self.box_id),
        ];
        if self.cgroup {
            args.push("--cg".to_owned());
        }

        match self.action {
            IsolateAction::Init => args.push("--init".to_owned()),
            IsolateAction::Cleanup => args.push("--cleanup".to_owned()),
            IsolateAction::Run => {
                args.push("--run".to_owned());
                if self.silent {
                    args.push("--silent".to_owned());
                }
                push_limits(&mut args, &self.limits, self.cgroup);

                for mount in &self.mounts {
                    if mount.optional && !Path::new(&mount.source).exists() {
                        continue;
                    }
                    let mut opts = String::new();
                    if mount.writable {
                        opts.push_str(":rw");
                    }
                    if mount.optional {
                        opts.push_str(":maybe");
                    }
                    args.push(format!("--dir={}={}{}", mount.target, mount.source, opts));
                }

                for (key, value) in &self.env {
                    args.push(format!("--env={key}={value}"));
                }
                if let Some(ref meta) = self.meta_file {
                    args.push(format!("--meta={}", meta.display()));
                }
                if let Some(ref stdin) = self.stdin {
                    args.push(format!("--stdin={}", stdin.display()));
                }
                if let Some(ref dir) = self.working_dir {
                    args.push(format!("--chdir={dir}"));
                }

                args.push("--".to_owned());
                args.extend(self.command);
            }
        }

        args
    }

    pub fn box_id(&self) -> u32 {
        self.box_id
    }
}

fn push_limits(args: &mut Vec<String>, limits: &ResourceLimits, cgroup: bool) {
    if let Some(time) = limits.time_limit {
        args.push(format!("--time={time}"));
    }
    if let Some(wall_time) = limits.wall_time_limit {
        args.push(format!("--wall-time={wall_time}"));
    }
    if let Some(extra_time) = limits.extra_time {
        args.push(format!("--extra-time={extra_time}"));
    }
    if let Some(memory) = limits.memory_limit {
        if cgroup {
            args.push(format!("--cg-mem={memory}"));
        } else {
            args.push(format!("--mem={memory}"));
        }
    }
    if let Some(stack) = limits.stack_limit {
        args.push(format!("--stack={stack}"));
    }
    if let Some(procs) = limits.max_processes {
        args.push(format!("--processes={procs}"));
    }
    if let Some(fsize) = limits.max_output {
        args.push(format!("--fsize={fsize}"));
    }
    if let Some(open_files) = limits.max_open_files {
        args.push(format!("--open-files={open_files}"));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateAction {
    Init,
    Run,
    Cleanup,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_and_cleanup_take_no_run_options() {
        let init = IsolateCommand::new("isolate", 3)
            .action(IsolateAction::Init)
            .limits(ResourceLimits::default())
            .command(["python3"])
            .build();
        assert_eq!(init, vec!["isolate", "--box-id=3", "--init"]);

        let cleanup = IsolateCommand::new("isolate", 3)
            .action(IsolateAction::Cleanup)
            .cgroup(true)
            .build();
        assert_eq!(cleanup, vec!["isolate", "--box-id=3", "--cg", "--cleanup"]);
    }

    #[test]
    fn unset_limits_emit_no_flags() {
        let args = IsolateCommand::new("isolate", 0).command(["true"]).build();
        assert_eq!(args, vec!["isolate", "--box-id=0", "--run", "--", "true"]);
    }

    #[test]
    fn memory_flag_follows_cgroup_mode() {
        let limits = ResourceLimits::unset().with_memory_limit(65536);
        let rlimit = IsolateCommand::new("isolate", 0)
            .limits(limits.clone())
            .build();
        assert!(rlimit.contains(&"--mem=65536".to_owned()));

        let cg = IsolateCommand::new("isolate", 0)
            .cgroup(true)
            .limits(limits)
            .build();
        assert!(cg.contains(&"--cg-mem=65536".to_owned()));
        assert!(!cg.iter().any(|a| a.starts_with("--mem=")));
    }

    #[test]
    fn streamed_run_arguments() {
        let args = IsolateCommand::new("/usr/bin/isolate", 7)
            .silent(true)
            .limits(
                ResourceLimits::unset()
                    .with_time_limit(2.0)
                    .with_wall_time_limit(4.0)
                    .with_max_processes(1),
            )
            .env("PYTHONUNBUFFERED", "1")
            .env("HOME", "/box")
            .meta_file("/var/local/lib/isolate/7/meta.txt")
            .stdin("/box/stdin.txt")
            .working_dir("/box")
            .command(["/usr/bin/python3", "main.py"])
            .build();

        assert_eq!(
            args,
            vec![
                "/usr/bin/isolate",
                "--box-id=7",
                "--run",
                "--silent",
                "--time=2",
                "--wall-time=4",
                "--processes=1",
                "--env=HOME=/box",
                "--env=PYTHONUNBUFFERED=1",
                "--meta=/var/local/lib/isolate/7/meta.txt",
                "--stdin=/box/stdin.txt",
                "--chdir=/box",
                "--",
                "/usr/bin/python3",
                "main.py",
            ]
        );
    }

    #[test]
    fn mount_options() {
        let args = IsolateCommand::new("isolate", 0)
            .mounts([
                MountConfig {
                    source: "/tmp".to_owned(),
                    target: "/scratch".to_owned(),
                    writable: true,
                    optional: false,
                },
                MountConfig {
                    source: "/nonexistent/snipbox/runtime".to_owned(),
                    target: "/opt/runtime".to_owned(),
                    writable: false,
                    optional: true,
                },
                MountConfig {
                    source: "/etc".to_owned(),
                    target: "/etc".to_owned(),
                    writable: false,
                    optional: true,
                },
            ])
            .build();

        assert!(args.contains(&"--dir=/scratch=/tmp:rw".to_owned()));
        assert!(args.contains(&"--dir=/etc=/etc:maybe".to_owned()));
        assert!(!args.iter().any(|a| a.contains("/opt/runtime")));
    }
}
